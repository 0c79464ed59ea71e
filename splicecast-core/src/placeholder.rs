use std::collections::BTreeMap;
use std::path::Path;

use crate::process::CommandDescriptor;
use crate::profile::TranscodeProfile;

/// Inputs shared by every placeholder encode.
#[derive(Debug, Clone)]
pub struct PlaceholderBuild<'a> {
    pub program: &'a str,
    pub image: &'a Path,
    pub duration: f64,
}

/// Splits encoder arguments into `flag -> value`. A flag followed by another
/// flag, or by nothing, maps to an empty value; stray values are skipped.
pub fn encoder_options(args: &[String]) -> BTreeMap<&str, &str> {
    let mut options = BTreeMap::new();
    let mut index = 0;
    while index < args.len() {
        let key = args[index].as_str();
        if !key.starts_with('-') {
            index += 1;
            continue;
        }
        match args.get(index + 1) {
            Some(value) if !value.starts_with('-') => {
                options.insert(key, value.as_str());
                index += 2;
            }
            _ => {
                options.insert(key, "");
                index += 1;
            }
        }
    }
    options
}

impl PlaceholderBuild<'_> {
    /// Encoder invocation turning the still image plus silence into a looping
    /// clip whose codecs match `profile`, written to `output`.
    pub fn descriptor(&self, profile: &TranscodeProfile, output: &Path) -> CommandDescriptor {
        let options = encoder_options(&profile.output_args);
        let pick = |keys: &[&str], fallback: &'static str| -> String {
            keys.iter()
                .find_map(|key| options.get(key).filter(|value| !value.is_empty()))
                .copied()
                .unwrap_or(fallback)
                .to_string()
        };
        let optional = |key: &str| {
            options
                .get(key)
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string())
        };

        let video_codec = pick(&["-c:v", "-vcodec"], "mpeg1video");
        let video_bitrate = pick(&["-b:v"], "800k");
        let frame_rate = pick(&["-r"], "24");
        let audio_codec = pick(&["-c:a", "-acodec"], "mp2");
        let audio_rate = pick(&["-ar"], "22050");
        let audio_channels = pick(&["-ac"], "2");
        let audio_bitrate = pick(&["-b:a"], "128k");
        let layout = if audio_channels == "1" { "mono" } else { "stereo" };

        let mut args: Vec<String> = vec![
            "-y".into(),
            "-loop".into(),
            "1".into(),
            "-i".into(),
            self.image.to_string_lossy().into_owned(),
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("anullsrc=channel_layout={layout}:sample_rate={audio_rate}"),
            "-shortest".into(),
            "-t".into(),
            self.duration.to_string(),
            "-r".into(),
            frame_rate,
            "-c:v".into(),
            video_codec,
            "-b:v".into(),
            video_bitrate,
        ];
        if let Some(bframes) = optional("-bf") {
            args.extend(["-bf".into(), bframes]);
        }
        if let Some(filter) = optional("-vf") {
            args.extend(["-vf".into(), filter]);
        }
        args.extend([
            "-c:a".into(),
            audio_codec,
            "-ar".into(),
            audio_rate,
            "-ac".into(),
            audio_channels,
        ]);
        if let Some(filter) = optional("-af") {
            args.extend(["-af".into(), filter]);
        }
        args.extend([
            "-b:a".into(),
            audio_bitrate,
            "-f".into(),
            "mpegts".into(),
            output.to_string_lossy().into_owned(),
        ]);
        CommandDescriptor::new(self.program, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|arg| arg == flag)
            .and_then(|index| args.get(index + 1))
            .map(String::as_str)
    }

    #[test]
    fn options_pair_flags_with_values() {
        let args = strings(&["-vf", "scale=320:240", "-an", "-b:v", "400k", "stray", "-y"]);
        let options = encoder_options(&args);
        assert_eq!(options.get("-vf"), Some(&"scale=320:240"));
        assert_eq!(options.get("-an"), Some(&""));
        assert_eq!(options.get("-b:v"), Some(&"400k"));
        assert_eq!(options.get("-y"), Some(&""));
        assert!(!options.contains_key("stray"));
    }

    #[test]
    fn descriptor_follows_profile_codecs() {
        let profile = TranscodeProfile {
            name: "aga_low".into(),
            output_args: strings(&[
                "-vf", "scale=320:240", "-r", "25", "-c:v", "mpeg1video", "-b:v", "400k",
                "-c:a", "mp2", "-ar", "22050", "-ac", "1", "-b:a", "64k",
            ]),
            description: None,
            listen_port: Some(5001),
        };
        let build = PlaceholderBuild {
            program: "ffmpeg",
            image: Path::new("/assets/placeholder.jpg"),
            duration: 10.0,
        };
        let descriptor = build.descriptor(&profile, Path::new("/assets/placeholders/aga_low.ts"));
        let args = &descriptor.args;
        assert_eq!(descriptor.program, "ffmpeg");
        assert_eq!(value_after(args, "-loop"), Some("1"));
        assert_eq!(args[4], "/assets/placeholder.jpg");
        assert!(args.contains(&"anullsrc=channel_layout=mono:sample_rate=22050".to_string()));
        assert_eq!(value_after(args, "-t"), Some("10"));
        assert_eq!(value_after(args, "-r"), Some("25"));
        assert_eq!(value_after(args, "-vf"), Some("scale=320:240"));
        assert_eq!(value_after(args, "-b:a"), Some("64k"));
        assert!(!args.contains(&"-bf".to_string()));
        assert_eq!(
            args[args.len() - 3..],
            strings(&["-f", "mpegts", "/assets/placeholders/aga_low.ts"])
        );
    }

    #[test]
    fn descriptor_defaults_when_profile_is_bare() {
        let profile = TranscodeProfile {
            name: "bare".into(),
            output_args: strings(&["-vcodec", "mpeg2video", "-bf", "0"]),
            description: None,
            listen_port: None,
        };
        let build = PlaceholderBuild {
            program: "ffmpeg",
            image: Path::new("still.jpg"),
            duration: 2.5,
        };
        let args = build.descriptor(&profile, Path::new("bare.ts")).args;
        assert_eq!(value_after(&args, "-c:v"), Some("mpeg2video"));
        assert_eq!(value_after(&args, "-bf"), Some("0"));
        assert_eq!(value_after(&args, "-b:v"), Some("800k"));
        assert_eq!(value_after(&args, "-r"), Some("24"));
        assert_eq!(value_after(&args, "-c:a"), Some("mp2"));
        assert_eq!(value_after(&args, "-ac"), Some("2"));
        assert_eq!(value_after(&args, "-t"), Some("2.5"));
        assert!(args.contains(&"anullsrc=channel_layout=stereo:sample_rate=22050".to_string()));
    }
}
