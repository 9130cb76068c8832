//! CLI handler for the `devices` command.

use anyhow::Result;

use crate::backend::resolve_monitor_device;

pub async fn handle_devices_command() -> Result<()> {
    let backend = super::native_backend();
    let capabilities = backend.probe().await;

    println!("Platform: {}", capabilities.platform);
    println!(
        "Loopback stream: {}",
        if capabilities.loopback_stream { "available" } else { "not available" }
    );
    println!(
        "Capture tool (ffmpeg + pactl): {}",
        if capabilities.capture_tool { "available" } else { "not available" }
    );

    if !capabilities.capture_tool {
        return Ok(());
    }

    let devices = match backend.list_sources().await {
        Ok(devices) => devices,
        Err(e) => {
            println!("Could not list sources: {}", e);
            return Ok(());
        }
    };

    let chosen = resolve_monitor_device(&devices).map(|d| d.name.clone());
    println!();
    println!("Sources:");
    for device in &devices {
        let marker = if chosen.as_deref() == Some(device.name.as_str()) {
            "*"
        } else {
            " "
        };
        println!("  {} {} ({})", marker, device.name, device.label);
    }
    match chosen {
        Some(name) => println!("\nSystem audio would be captured from {}", name),
        None => println!("\nNo monitor source found; recordings would be microphone only"),
    }

    Ok(())
}
