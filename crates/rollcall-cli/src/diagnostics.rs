//! `rollcall test` and `rollcall check`.

use anyhow::{bail, Result};
use rollcall_core::provider::missing_models;
use rollcall_core::Config;
use rollcall_hw::{open_first_available, Camera, FrameSource};
use rollcall_store::FaceStore;

/// Report which camera index opens and what one frame looks like.
pub fn camera_test(config: &Config) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("  no V4L2 capture devices found");
    }
    for dev in &devices {
        println!("  {} {} (driver {}, bus {})", dev.path, dev.name, dev.driver, dev.bus);
    }

    let (index, mut camera) = open_first_available(&config.camera_indices, Camera::open_index)?;
    println!("  opened index {index}: {}", camera.describe());

    let frame = camera.next_frame()?;
    println!(
        "  captured frame #{}: {}x{}, average brightness {:.1}",
        frame.sequence,
        frame.width,
        frame.height,
        frame.avg_brightness()
    );
    println!("Camera OK");
    Ok(())
}

/// One line of the dependency report.
#[derive(Debug, PartialEq, Eq)]
pub struct CheckItem {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

/// Model files and the data directory; cameras are covered by `camera_test`.
pub fn collect_checks(config: &Config) -> Vec<CheckItem> {
    let missing = missing_models(&config.model_dir);
    let models = CheckItem {
        name: "face models".to_string(),
        ok: missing.is_empty(),
        detail: if missing.is_empty() {
            config.model_dir.display().to_string()
        } else {
            format!("missing {} in {}", missing.join(", "), config.model_dir.display())
        },
    };

    let data = match FaceStore::open(&config.data_dir).and_then(|store| store.count()) {
        Ok(count) => CheckItem {
            name: "data directory".to_string(),
            ok: true,
            detail: format!("{} ({count} persons)", config.data_dir.display()),
        },
        Err(e) => CheckItem {
            name: "data directory".to_string(),
            ok: false,
            detail: e.to_string(),
        },
    };

    let cameras = Camera::list_devices();
    let camera = CheckItem {
        name: "cameras".to_string(),
        ok: !cameras.is_empty(),
        detail: if cameras.is_empty() {
            "no V4L2 capture devices".to_string()
        } else {
            cameras.iter().map(|d| d.path.as_str()).collect::<Vec<_>>().join(", ")
        },
    };

    vec![models, data, camera]
}

pub fn check(config: &Config) -> Result<()> {
    println!("Checking dependencies...");
    let items = collect_checks(config);
    for item in &items {
        println!("  [{}] {}: {}", if item.ok { "ok" } else { "!!" }, item.name, item.detail);
    }
    if items.iter().any(|i| !i.ok && i.name == "face models") {
        println!(
            "\nDownload the insightface buffalo_l pack and copy det_10g.onnx and w600k_r50.onnx into {},\n\
             or set ROLLCALL_MODEL_DIR.",
            config.model_dir.display()
        );
    }
    if items.iter().any(|i| !i.ok) {
        bail!("dependency check failed");
    }
    println!("All dependencies satisfied.");
    Ok(())
}
