use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;
use splicecast_core::process::describe_status;
use splicecast_core::{
    load_splicecast_config, CommandDescriptor, PlaceholderBuild, ProcessChain, ProfileRegistry,
};
use tracing::info;

use crate::{render, AppError, DisplayFallback, OutputFormat, Result};

#[derive(Args, Debug)]
pub struct PlaceholdersArgs {
    /// Clip length in seconds
    #[arg(long, default_value_t = 10.0)]
    pub duration: f64,
    /// Print the encoder commands without running them
    #[arg(long)]
    pub dry_run: bool,
    /// Encoder program
    #[arg(long, default_value = "ffmpeg")]
    pub encoder: String,
    /// Still image to encode; defaults to paths.placeholder_image
    #[arg(long, value_name = "PATH")]
    pub image: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct PlaceholderClip {
    profile: String,
    output: PathBuf,
    command: String,
    #[serde(skip)]
    descriptor: CommandDescriptor,
}

#[derive(Debug, Serialize)]
struct PlaceholderReport {
    dry_run: bool,
    image: PathBuf,
    clips: Vec<PlaceholderClip>,
}

impl DisplayFallback for PlaceholderReport {
    fn display(&self) -> String {
        self.clips
            .iter()
            .map(|clip| {
                if self.dry_run {
                    clip.command.clone()
                } else {
                    format!("{:<16} {}", clip.profile, clip.output.display())
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn plan(config_path: &Path, args: &PlaceholdersArgs) -> Result<PlaceholderReport> {
    if !args.duration.is_finite() || args.duration <= 0.0 {
        return Err(AppError::InvalidArgument(format!(
            "duration must be positive, got {}",
            args.duration
        )));
    }
    let config = load_splicecast_config(config_path)?;
    let registry = ProfileRegistry::load_dir(config.profiles_dir())?;
    let profiles = registry.list();
    if profiles.is_empty() {
        return Err(AppError::NoProfiles(config.profiles_dir()));
    }
    let image = args
        .image
        .clone()
        .unwrap_or_else(|| config.placeholder_image());
    let build = PlaceholderBuild {
        program: &args.encoder,
        image: &image,
        duration: args.duration,
    };
    let clips = profiles
        .iter()
        .map(|profile| {
            let output = config.placeholder_file(&profile.name);
            let descriptor = build.descriptor(profile, &output);
            PlaceholderClip {
                profile: profile.name.clone(),
                output,
                command: descriptor.to_string(),
                descriptor,
            }
        })
        .collect();
    Ok(PlaceholderReport {
        dry_run: args.dry_run,
        image,
        clips,
    })
}

pub async fn run(
    config_path: &Path,
    args: &PlaceholdersArgs,
    format: OutputFormat,
) -> Result<()> {
    let report = plan(config_path, args)?;
    if !report.dry_run {
        encode(&report).await?;
    }
    render(&report, format)
}

async fn encode(report: &PlaceholderReport) -> Result<()> {
    if !report.image.is_file() {
        return Err(AppError::MissingFile(report.image.clone()));
    }
    for clip in &report.clips {
        if let Some(dir) = clip.output.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        info!(profile = %clip.profile, output = %clip.output.display(), "encoding placeholder");
        let mut chain = ProcessChain::spawn(
            format!("placeholder-{}", clip.profile),
            std::slice::from_ref(&clip.descriptor),
            None,
        )?;
        let status = chain.wait().await?;
        if !status.success() {
            return Err(AppError::ChainFailed {
                chain: chain.label().to_string(),
                status: describe_status(&status),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("profiles")).unwrap();
        fs::write(
            root.join("profiles/aga_low.json"),
            r#"{"name": "aga_low", "output_args": ["-c:v", "mpeg1video", "-ac", 1]}"#,
        )
        .unwrap();
        let config = root.join("splicecast.toml");
        fs::write(
            &config,
            r#"
            [paths]
            work_dir = "runs"
            profiles_dir = "profiles"
            placeholder_dir = "placeholders"
            placeholder_image = "still.jpg"

            [commands.fetcher]
            program = "streamlink"

            [commands.encoder]
            program = "ffmpeg"
            "#,
        )
        .unwrap();
        (temp, config)
    }

    fn args(encoder: &str, dry_run: bool) -> PlaceholdersArgs {
        PlaceholdersArgs {
            duration: 3.0,
            dry_run,
            encoder: encoder.to_string(),
            image: None,
        }
    }

    #[test]
    fn dry_run_plans_one_clip_per_profile() {
        let (temp, config) = workspace();
        let report = plan(&config, &args("ffmpeg", true)).unwrap();
        assert_eq!(report.clips.len(), 1);
        let clip = &report.clips[0];
        assert_eq!(clip.output, temp.path().join("placeholders/aga_low.ts"));
        assert!(clip.command.starts_with("ffmpeg -y -loop 1 -i "));
        assert!(clip.command.contains("channel_layout=mono"));
        assert!(clip.command.ends_with("aga_low.ts"));
        assert_eq!(report.display(), clip.command);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["clips"][0]["profile"], "aga_low");
        assert!(json["clips"][0].get("descriptor").is_none());
    }

    #[test]
    fn non_positive_duration_is_rejected() {
        let (_temp, config) = workspace();
        let mut args = args("ffmpeg", true);
        args.duration = 0.0;
        assert!(matches!(
            plan(&config, &args),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn missing_image_stops_before_encoding() {
        let (temp, config) = workspace();
        let err = run(&config, &args("true", false), OutputFormat::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MissingFile(path) if path == temp.path().join("still.jpg")));
        assert!(!temp.path().join("placeholders").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn encoder_exit_status_is_checked() {
        let (temp, config) = workspace();
        fs::write(temp.path().join("still.jpg"), b"jpeg").unwrap();

        run(&config, &args("true", false), OutputFormat::Json)
            .await
            .unwrap();
        assert!(temp.path().join("placeholders").is_dir());

        let err = run(&config, &args("false", false), OutputFormat::Text)
            .await
            .unwrap_err();
        match err {
            AppError::ChainFailed { chain, status } => {
                assert_eq!(chain, "placeholder-aga_low");
                assert_eq!(status, "exit code 1");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
