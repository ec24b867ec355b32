//! Local capture directory management.
//!
//! Without an attached analyzer the session produces a self-contained
//! capture directory: the framed data file, the captured-session and
//! counters descriptions, and any image artifacts the user asked to bundle.
//! The directory must end up complete or not exist at all; the fault path
//! removes it recursively.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::warn;

use crate::config::CapturedSpe;
use crate::config::CounterConfig;

pub const CAPTURED_FILE_NAME: &str = "captured.xml";
pub const COUNTERS_FILE_NAME: &str = "counters.xml";
pub const EVENTS_FILE_NAME: &str = "events.xml";

/// Create the capture directory. An existing directory is refused rather
/// than clobbered.
pub fn create_capture_directory(dir: &Path) -> Result<()> {
    if dir.exists() {
        bail!("capture directory {} already exists", dir.display());
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create capture directory {}", dir.display()))
}

/// Copy the configured image artifacts into the capture directory. A
/// missing image is not fatal to the capture.
pub fn copy_images(dir: &Path, images: &[std::path::PathBuf]) {
    for image in images {
        let Some(name) = image.file_name() else {
            warn!("image path {} has no file name, skipped", image.display());
            continue;
        };
        if let Err(e) = std::fs::copy(image, dir.join(name)) {
            warn!("failed to copy image {}: {}", image.display(), e);
        }
    }
}

/// Remove an incomplete capture directory and everything in it.
pub fn remove_capture_directory(dir: &Path) -> Result<()> {
    std::fs::remove_dir_all(dir)
        .with_context(|| format!("failed to remove capture directory {}", dir.display()))
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Describe the finished capture: how the session was configured and which
/// SPE configurations were live.
pub fn write_captured_description(
    dir: &Path,
    command: Option<&[String]>,
    duration_secs: u64,
    one_shot: bool,
    spes: &[CapturedSpe],
) -> Result<()> {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n");
    let _ = writeln!(
        xml,
        "<captured version=\"1\" duration=\"{}\" one_shot=\"{}\">",
        duration_secs, one_shot as u8
    );
    if let Some(argv) = command {
        let _ = writeln!(
            xml,
            "  <command line=\"{}\"/>",
            xml_escape(&argv.join(" "))
        );
    }
    for spe in spes {
        let _ = writeln!(
            xml,
            "  <spe id=\"{}\" key=\"{}\"/>",
            xml_escape(&spe.id),
            spe.key
        );
    }
    xml.push_str("</captured>\n");

    std::fs::write(dir.join(CAPTURED_FILE_NAME), xml)
        .context("failed to write captured description")
}

/// List the counters the session sampled.
pub fn write_counters_description(dir: &Path, counters: &[CounterConfig]) -> Result<()> {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n");
    xml.push_str("<counters>\n");
    for counter in counters {
        match counter.event {
            Some(event) => {
                let _ = writeln!(
                    xml,
                    "  <counter name=\"{}\" event=\"{:#x}\"/>",
                    xml_escape(&counter.name),
                    event
                );
            }
            None => {
                let _ = writeln!(xml, "  <counter name=\"{}\"/>", xml_escape(&counter.name));
            }
        }
    }
    xml.push_str("</counters>\n");

    std::fs::write(dir.join(COUNTERS_FILE_NAME), xml)
        .context("failed to write counters description")
}

/// Emit the event catalog for the analyzer's offline import. The catalog
/// content is produced by the drivers; this writes what the session knows.
pub fn write_event_catalog(dir: &Path, counters: &[CounterConfig]) -> Result<()> {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n");
    xml.push_str("<events>\n");
    for counter in counters {
        let _ = writeln!(xml, "  <event counter=\"{}\"/>", xml_escape(&counter.name));
    }
    xml.push_str("</events>\n");

    std::fs::write(dir.join(EVENTS_FILE_NAME), xml).context("failed to write event catalog")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_existing_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("session.apc");
        create_capture_directory(&dir).unwrap();
        assert!(create_capture_directory(&dir).is_err());
        remove_capture_directory(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn descriptions_escape_markup() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("session.apc");
        create_capture_directory(&dir).unwrap();

        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "a < b".to_string()];
        write_captured_description(&dir, Some(&argv), 10, false, &[]).unwrap();
        let text = std::fs::read_to_string(dir.join(CAPTURED_FILE_NAME)).unwrap();
        assert!(text.contains("a &lt; b"));
        assert!(text.contains("duration=\"10\""));

        write_counters_description(
            &dir,
            &[CounterConfig {
                name: "cpu.user".into(),
                event: Some(0x11),
            }],
        )
        .unwrap();
        let text = std::fs::read_to_string(dir.join(COUNTERS_FILE_NAME)).unwrap();
        assert!(text.contains("name=\"cpu.user\" event=\"0x11\""));
    }
}
