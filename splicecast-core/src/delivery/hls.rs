use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HlsSection;

pub const OUTPUT_MANIFEST: &str = "index.m3u8";

#[derive(Debug, Error)]
pub enum HlsError {
    #[error("hls io error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> HlsError + '_ {
    move |source| HlsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct HlsSettings {
    pub source_manifest: PathBuf,
    pub output_dir: PathBuf,
    pub poll_interval: Duration,
    pub segment_timeout: Duration,
    pub segment_duration: f64,
    pub target_duration: u32,
    pub keep_segments: usize,
    /// Zero disables gap filling.
    pub gap_timeout: Duration,
}

impl HlsSettings {
    pub fn from_section(
        section: &HlsSection,
        source_manifest: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_manifest: source_manifest.into(),
            output_dir: output_dir.into(),
            poll_interval: Duration::from_millis(section.poll_interval_ms.max(1)),
            segment_timeout: Duration::from_millis(section.segment_timeout_ms),
            segment_duration: section.segment_duration,
            target_duration: section.target_duration,
            keep_segments: section.keep_segments.max(1),
            gap_timeout: Duration::from_millis(section.gap_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    pub uri: String,
    pub duration: f64,
    pub discontinuity: bool,
}

/// Re-emits segments of a local HLS source under normalized names with a
/// rolling manifest, duplicating the last segment when the source stalls.
#[derive(Debug)]
pub struct HlsRepackager {
    settings: HlsSettings,
    window: VecDeque<SegmentEntry>,
    processed: HashSet<String>,
    sequence: u64,
    last_output: Option<PathBuf>,
    last_source_at: Instant,
}

impl HlsRepackager {
    pub async fn new(settings: HlsSettings) -> Result<Self, HlsError> {
        tokio::fs::create_dir_all(&settings.output_dir)
            .await
            .map_err(io_error(&settings.output_dir))?;
        Ok(Self {
            window: VecDeque::with_capacity(settings.keep_segments),
            settings,
            processed: HashSet::new(),
            sequence: 0,
            last_output: None,
            last_source_at: Instant::now(),
        })
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.settings.output_dir.join(OUTPUT_MANIFEST)
    }

    pub fn window(&self) -> impl Iterator<Item = &SegmentEntry> {
        self.window.iter()
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence
    }

    pub fn last_source_at(&self) -> Instant {
        self.last_source_at
    }

    /// Copies every new, stable source segment. Returns how many were emitted.
    ///
    /// Segments that never stabilize or cannot be copied are skipped.
    pub async fn ingest(&mut self) -> Result<usize, HlsError> {
        let uris = read_manifest(&self.settings.source_manifest).await;
        let source_dir = self
            .settings
            .source_manifest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut emitted = 0;
        for uri in &uris {
            if self.processed.contains(uri) {
                continue;
            }
            let source = source_dir.join(uri);
            let stable = wait_for_stable(
                &source,
                self.settings.poll_interval,
                self.settings.segment_timeout,
            )
            .await;
            self.processed.insert(uri.clone());
            if !stable {
                warn!(segment = %uri, "segment never stabilized, skipping");
                continue;
            }
            let name = segment_name(self.sequence);
            let target = self.settings.output_dir.join(&name);
            if let Err(err) = tokio::fs::copy(&source, &target).await {
                warn!(segment = %uri, error = %err, "failed to copy segment, skipping");
                let _ = tokio::fs::remove_file(&target).await;
                continue;
            }
            self.publish(name.clone(), target, false).await?;
            debug!(segment = %uri, output = %name, "segment repackaged");
            self.last_source_at = Instant::now();
            emitted += 1;
        }
        // forget uris the source playlist has rotated out
        if !uris.is_empty() {
            self.processed.retain(|uri| uris.contains(uri));
        }
        Ok(emitted)
    }

    /// Duplicates the most recent output segment with a discontinuity marker
    /// when no source segment arrived within the gap timeout.
    pub async fn fill_gap(&mut self, now: Instant) -> Result<bool, HlsError> {
        if self.settings.gap_timeout.is_zero() || self.window.is_empty() {
            return Ok(false);
        }
        let Some(last) = self.last_output.clone() else {
            return Ok(false);
        };
        if now.saturating_duration_since(self.last_source_at) < self.settings.gap_timeout {
            return Ok(false);
        }
        let name = segment_name(self.sequence);
        let target = self.settings.output_dir.join(&name);
        tokio::fs::copy(&last, &target)
            .await
            .map_err(io_error(&last))?;
        self.publish(name.clone(), target, true).await?;
        info!(output = %name, "source stalled, repeated last segment");
        self.last_source_at = now;
        Ok(true)
    }

    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), HlsError> {
        info!(
            source = %self.settings.source_manifest.display(),
            output = %self.settings.output_dir.display(),
            "hls repackager started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.ingest().await?;
            self.fill_gap(Instant::now()).await?;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.settings.poll_interval) => {}
            }
        }
        info!(emitted = self.sequence, "hls repackager stopped");
        Ok(())
    }

    /// Appends a copied segment to the window, deletes the segment that
    /// falls out of it and rewrites the manifest.
    async fn publish(
        &mut self,
        name: String,
        target: PathBuf,
        discontinuity: bool,
    ) -> Result<(), HlsError> {
        let evicted = if self.window.len() == self.settings.keep_segments {
            self.window.pop_front()
        } else {
            None
        };
        self.window.push_back(SegmentEntry {
            uri: name,
            duration: self.settings.segment_duration,
            discontinuity,
        });
        self.sequence += 1;
        self.last_output = Some(target);
        self.write_manifest().await?;

        if let Some(evicted) = evicted {
            let path = self.settings.output_dir.join(&evicted.uri);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(segment = %evicted.uri, "expired segment removed"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove expired segment")
                }
            }
        }
        Ok(())
    }

    async fn write_manifest(&self) -> Result<(), HlsError> {
        let path = self.manifest_path();
        let tmp = path.with_extension("m3u8.tmp");
        let body = render_manifest(self.window.iter(), self.settings.target_duration);
        tokio::fs::write(&tmp, body).await.map_err(io_error(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_error(&path))
    }
}

pub fn segment_name(sequence: u64) -> String {
    format!("segment_{sequence:05}.ts")
}

/// Non-comment, non-empty lines of a playlist.
pub fn parse_manifest(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn render_manifest<'a>(
    segments: impl IntoIterator<Item = &'a SegmentEntry>,
    target_duration: u32,
) -> String {
    let mut lines = vec![
        "#EXTM3U".to_string(),
        "#EXT-X-VERSION:3".to_string(),
        format!("#EXT-X-TARGETDURATION:{target_duration}"),
        "#EXT-X-MEDIA-SEQUENCE:0".to_string(),
    ];
    for segment in segments {
        if segment.discontinuity {
            lines.push("#EXT-X-DISCONTINUITY".to_string());
        }
        lines.push(format!("#EXTINF:{:.3},", segment.duration));
        lines.push(segment.uri.clone());
    }
    let mut manifest = lines.join("\n");
    manifest.push('\n');
    manifest
}

async fn read_manifest(path: &Path) -> Vec<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => parse_manifest(&text),
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to read source manifest");
            }
            Vec::new()
        }
    }
}

/// A segment is stable once it is non-empty and its size held for two
/// consecutive polls.
async fn wait_for_stable(path: &Path, poll: Duration, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    let mut last_size = None;
    let mut stable_polls = 0;
    while Instant::now() < deadline {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            let size = meta.len();
            if size > 0 {
                if last_size == Some(size) {
                    stable_polls += 1;
                    if stable_polls >= 2 {
                        return true;
                    }
                } else {
                    stable_polls = 0;
                    last_size = Some(size);
                }
            }
        }
        sleep(poll).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings(root: &Path) -> HlsSettings {
        HlsSettings {
            source_manifest: root.join("in/live.m3u8"),
            output_dir: root.join("out"),
            poll_interval: Duration::from_millis(5),
            segment_timeout: Duration::from_millis(200),
            segment_duration: 4.0,
            target_duration: 6,
            keep_segments: 3,
            gap_timeout: Duration::from_secs(20),
        }
    }

    fn write_source(root: &Path, segments: &[&str]) {
        let dir = root.join("in");
        std::fs::create_dir_all(&dir).unwrap();
        let mut manifest = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
        for name in segments {
            std::fs::write(dir.join(name), name.as_bytes()).unwrap();
            manifest.push_str("#EXTINF:4.0,\n");
            manifest.push_str(name);
            manifest.push('\n');
        }
        std::fs::write(dir.join("live.m3u8"), manifest).unwrap();
    }

    #[test]
    fn parse_skips_tags_and_blank_lines() {
        let uris = parse_manifest("#EXTM3U\n\n#EXTINF:4.0,\nchunk-1.ts\n  chunk-2.ts  \n");
        assert_eq!(uris, vec!["chunk-1.ts", "chunk-2.ts"]);
    }

    #[test]
    fn render_marks_discontinuities() {
        let segments = [
            SegmentEntry {
                uri: "segment_00000.ts".into(),
                duration: 4.0,
                discontinuity: false,
            },
            SegmentEntry {
                uri: "segment_00001.ts".into(),
                duration: 4.0,
                discontinuity: true,
            },
        ];
        let manifest = render_manifest(segments.iter(), 6);
        assert_eq!(
            manifest,
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n\
             #EXTINF:4.000,\nsegment_00000.ts\n\
             #EXT-X-DISCONTINUITY\n#EXTINF:4.000,\nsegment_00001.ts\n"
        );
    }

    #[tokio::test]
    async fn ingest_renames_and_bounds_the_window() {
        let dir = tempdir().unwrap();
        write_source(dir.path(), &["a.ts", "b.ts", "c.ts", "d.ts"]);
        let mut repack = HlsRepackager::new(settings(dir.path())).await.unwrap();

        assert_eq!(repack.ingest().await.unwrap(), 4);
        assert_eq!(repack.ingest().await.unwrap(), 0);

        let names: Vec<_> = repack.window().map(|s| s.uri.clone()).collect();
        assert_eq!(
            names,
            vec!["segment_00001.ts", "segment_00002.ts", "segment_00003.ts"]
        );
        let copied = std::fs::read(dir.path().join("out/segment_00003.ts")).unwrap();
        assert_eq!(copied, b"d.ts");
        assert!(!dir.path().join("out/segment_00000.ts").exists());
        assert!(dir.path().join("out/segment_00001.ts").exists());
        let manifest = std::fs::read_to_string(repack.manifest_path()).unwrap();
        assert!(manifest.contains("segment_00003.ts"));
        assert!(!manifest.contains("segment_00000.ts"));
    }

    #[tokio::test]
    async fn missing_segment_is_skipped_after_timeout() {
        let dir = tempdir().unwrap();
        write_source(dir.path(), &["a.ts"]);
        let manifest = dir.path().join("in/live.m3u8");
        let mut text = std::fs::read_to_string(&manifest).unwrap();
        text.push_str("#EXTINF:4.0,\nghost.ts\n");
        std::fs::write(&manifest, text).unwrap();

        let mut repack = HlsRepackager::new(settings(dir.path())).await.unwrap();
        assert_eq!(repack.ingest().await.unwrap(), 1);
        assert_eq!(repack.next_sequence(), 1);
        // not retried
        assert_eq!(repack.ingest().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn uncopyable_segment_is_skipped() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("in");
        std::fs::create_dir_all(source.join("broken.ts")).unwrap();
        std::fs::write(source.join("broken.ts/inner"), b"x").unwrap();
        std::fs::write(source.join("good.ts"), b"good").unwrap();
        std::fs::write(
            source.join("live.m3u8"),
            "#EXTM3U\n#EXTINF:4.0,\nbroken.ts\n#EXTINF:4.0,\ngood.ts\n",
        )
        .unwrap();

        let mut repack = HlsRepackager::new(settings(dir.path())).await.unwrap();
        assert_eq!(repack.ingest().await.unwrap(), 1);
        let names: Vec<_> = repack.window().map(|s| s.uri.clone()).collect();
        assert_eq!(names, vec!["segment_00000.ts"]);
        assert_eq!(
            std::fs::read(dir.path().join("out/segment_00000.ts")).unwrap(),
            b"good"
        );
        assert_eq!(repack.ingest().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rotated_out_uris_are_forgotten() {
        let dir = tempdir().unwrap();
        write_source(dir.path(), &["a.ts", "b.ts"]);
        let mut repack = HlsRepackager::new(settings(dir.path())).await.unwrap();
        assert_eq!(repack.ingest().await.unwrap(), 2);

        write_source(dir.path(), &["b.ts", "c.ts"]);
        assert_eq!(repack.ingest().await.unwrap(), 1);
        let mut remembered: Vec<_> = repack.processed.iter().cloned().collect();
        remembered.sort();
        assert_eq!(remembered, vec!["b.ts", "c.ts"]);
    }

    #[tokio::test]
    async fn gap_repeats_last_segment_with_discontinuity() {
        let dir = tempdir().unwrap();
        write_source(dir.path(), &["a.ts", "b.ts", "c.ts", "d.ts", "e.ts"]);
        let mut repack = HlsRepackager::new(settings(dir.path())).await.unwrap();
        repack.ingest().await.unwrap();

        let early = repack.last_source_at() + Duration::from_secs(5);
        assert!(!repack.fill_gap(early).await.unwrap());

        let later = repack.last_source_at() + Duration::from_secs(25);
        assert!(repack.fill_gap(later).await.unwrap());

        let window: Vec<_> = repack.window().cloned().collect();
        assert_eq!(window.len(), 3);
        let last = window.last().unwrap();
        assert_eq!(last.uri, "segment_00005.ts");
        assert!(last.discontinuity);
        assert_eq!(
            std::fs::read(dir.path().join("out/segment_00005.ts")).unwrap(),
            std::fs::read(dir.path().join("out/segment_00004.ts")).unwrap()
        );
        let manifest = std::fs::read_to_string(repack.manifest_path()).unwrap();
        assert!(manifest.contains("#EXT-X-DISCONTINUITY\n#EXTINF:4.000,\nsegment_00005.ts"));
    }

    #[tokio::test]
    async fn no_gap_fill_before_first_segment() {
        let dir = tempdir().unwrap();
        let mut repack = HlsRepackager::new(settings(dir.path())).await.unwrap();
        let later = repack.last_source_at() + Duration::from_secs(60);
        assert!(!repack.fill_gap(later).await.unwrap());
    }
}
