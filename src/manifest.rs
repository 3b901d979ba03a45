use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::schema::BenchManifest;

/// Reads, parses and validates a bench manifest.
///
/// Relative output paths are resolved against the manifest's directory so a
/// run behaves the same regardless of the working directory.
pub fn load_and_validate_manifest(path: &Path) -> Result<BenchManifest> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let mut manifest = parse_manifest(&contents)
        .with_context(|| format!("failed to parse manifest {}", path.display()))?;

    manifest
        .validate()
        .with_context(|| format!("invalid manifest {}", path.display()))?;

    let manifest_dir = path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    resolve_output_paths(&mut manifest, &manifest_dir);
    Ok(manifest)
}

pub fn parse_manifest(contents: &str) -> Result<BenchManifest> {
    serde_yaml::from_str(contents).map_err(|error| {
        let location = error
            .location()
            .map(|location| format!("line {}, column {}", location.line(), location.column()))
            .unwrap_or_else(|| "unknown location".to_owned());
        anyhow!("yaml error at {}: {}", location, error)
    })
}

fn resolve_output_paths(manifest: &mut BenchManifest, manifest_dir: &Path) {
    if let Some(frame_capture) = &mut manifest.frame_capture {
        frame_capture.output_dir = resolve(manifest_dir, &frame_capture.output_dir);
    }
    if let Some(video_capture) = &mut manifest.video_capture {
        video_capture.output_dir = resolve(manifest_dir, &video_capture.output_dir);
    }
    if let Some(timing_capture) = &mut manifest.timing_capture {
        timing_capture.path = resolve(manifest_dir, &timing_capture.path);
    }
    if let Some(output) = manifest
        .profiler
        .as_mut()
        .and_then(|profiler| profiler.output.as_mut())
    {
        *output = resolve(manifest_dir, output);
    }
}

fn resolve(manifest_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        manifest_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::load_and_validate_manifest;
    use crate::error::find_capture_error;

    #[test]
    fn relative_output_paths_resolve_against_manifest_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bench.yaml");
        fs::write(
            &path,
            r#"
version: 1
graphs: [restir]
clock: { exit_frame: 3 }
frame_capture:
  output_dir: frames
  base_filename: shot
  frames: { restir: [1] }
timing_capture: { path: times/frame_times.csv }
profiler: { output: profile.json }
"#,
        )
        .expect("manifest should write");

        let manifest = load_and_validate_manifest(&path).expect("manifest should load");
        assert_eq!(
            manifest.frame_capture.expect("frame capture").output_dir,
            dir.path().join("frames")
        );
        assert_eq!(
            manifest.timing_capture.expect("timing capture").path,
            dir.path().join("times/frame_times.csv")
        );
        assert_eq!(
            manifest.profiler.and_then(|profiler| profiler.output),
            Some(dir.path().join("profile.json"))
        );
    }

    #[test]
    fn validation_errors_keep_their_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bench.yaml");
        fs::write(&path, "version: 2\ngraphs: [restir]\nclock: { exit_frame: 3 }\n")
            .expect("manifest should write");

        let error = load_and_validate_manifest(&path).expect_err("version 2 should fail");
        assert_eq!(
            find_capture_error(&error).map(|error| error.code()),
            Some("config")
        );
    }
}
