//! CLI application for PixelAir lights.
//!
//! Discovers devices, attaches one by MAC address and drives it through the
//! same coordinator a host application would use.
//!
//! Run with: cargo run --example pixelair_cli -- --help

use clap::{Parser, Subcommand};
use std::time::Duration;
use pixelair_rs::{
    DeviceMode, Hub, IdentityRecord, LightEntity, SetupStep, Settings, TurnOn,
};

#[derive(Parser)]
#[command(name = "pixelair-cli")]
#[command(about = "Discover and control PixelAir lights from the command line", long_about = None)]
struct Cli {
    /// MAC address of the device (not required for discover/setup)
    #[arg(short, long, global = true)]
    mac: Option<String>,

    /// Serial number of the device, if known
    #[arg(short, long, global = true, default_value = "")]
    serial: String,

    /// Settings as a JSON object, e.g. '{"poll_interval": 1.0}'
    #[arg(long, global = true)]
    settings: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover all PixelAir devices on the network
    Discover,

    /// Run the setup flow and print the identity record to store
    Setup {
        /// Serial number to pick when several new devices answer
        #[arg(long)]
        pick: Option<String>,
    },

    /// Print the current state and diagnostics
    Status,

    /// Turn the device on
    On,

    /// Turn the device off
    Off,

    /// Set brightness in percent (0-100)
    Brightness {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        percent: u8,
    },

    /// Set hue (0-360) and saturation (0-100)
    Color { hue: f32, saturation: f32 },

    /// Activate an effect by its display name
    Effect { name: String },

    /// Switch between auto, scene and manual mode
    Mode { mode: DeviceMode },

    /// Print every published state change for a while
    Watch {
        /// How long to watch, in seconds
        #[arg(short, long, default_value = "60")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let settings = match &cli.settings {
        Some(json) => Settings::from_json(json)?,
        None => Settings::default(),
    };
    let hub = Hub::new(settings);

    match cli.command {
        Commands::Discover => {
            println!(
                "Discovering PixelAir devices (timeout: {:?})...",
                hub.settings().discovery_timeout
            );
            let devices = hub.discover().await?;
            if devices.is_empty() {
                println!("No devices found on the network.");
            }
            for device in devices {
                println!(
                    "  {:15}  MAC: {}  Serial: {}  Name: {}",
                    device.ip_address.to_string(),
                    device.mac_address,
                    device.serial_number,
                    device.display_name
                );
            }
        }

        Commands::Setup { pick } => {
            let mut flow = hub.setup_flow();
            let mut step = hub.run_discovery_flow(&mut flow).await?;
            if let Some(serial) = &pick {
                if matches!(step, SetupStep::Select(_)) {
                    println!("Several new devices found, picking {serial}");
                    step = flow.select(serial)?;
                }
            }

            match step {
                SetupStep::Confirm(device) => {
                    println!("Adding {} ({})", device.display_name, device.ip_address);
                    println!("{}", flow.confirm()?.to_json()?);
                }
                SetupStep::Select(options) => {
                    println!("Several new devices found; rerun with --pick <serial>:");
                    for option in options {
                        println!("  {}  {}", option.serial_number, option.label);
                    }
                }
                other => println!("Nothing to set up: {other:?}"),
            }
        }

        command => {
            let mac = cli.mac.ok_or("A MAC address is required for this command. Use --mac <MAC>")?;
            let record = IdentityRecord {
                display_name: mac.clone(),
                mac_address: mac,
                serial_number: cli.serial,
            };
            let coordinator = hub.attach(&record).await?;
            let light = LightEntity::new(coordinator.clone(), &record.display_name);

            match command {
                Commands::Discover | Commands::Setup { .. } => unreachable!(),

                Commands::Status => {
                    let info = light.device_info();
                    println!("{} ({}) at {}", info.name, info.model, coordinator.ip());
                    println!("  Power: {}", if light.is_on() { "ON" } else { "OFF" });
                    if let Some(brightness) = light.brightness() {
                        println!("  Brightness: {brightness}/255");
                    }
                    if let Some(color) = light.hs_color() {
                        println!("  Hue: {:.0}  Saturation: {:.0}%", color.hue(), color.saturation());
                    }
                    if let Some(effect) = light.effect() {
                        println!("  Effect: {effect}");
                    }
                    if let Some(effects) = light.effect_list() {
                        println!("  Effects: {}", effects.join(", "));
                    }
                    println!(
                        "\nDiagnostics:\n{}",
                        serde_json::to_string_pretty(&coordinator.diagnostics())?
                    );
                }

                Commands::On => {
                    light.turn_on(TurnOn::default()).await?;
                    println!("Device turned on");
                }

                Commands::Off => {
                    light.turn_off().await?;
                    println!("Device turned off");
                }

                Commands::Brightness { percent } => {
                    coordinator.set_brightness(f32::from(percent) / 100.0).await?;
                    println!("Brightness set to {percent}%");
                }

                Commands::Color { hue, saturation } => {
                    let color = pixelair_rs::HueSaturation::create(hue, saturation)
                        .ok_or("hue must be 0-360 and saturation 0-100")?;
                    light
                        .turn_on(TurnOn {
                            hs_color: Some(color),
                            ..TurnOn::default()
                        })
                        .await?;
                    println!("Color set to hue {hue}, saturation {saturation}%");
                }

                Commands::Effect { name } => {
                    light
                        .turn_on(TurnOn {
                            effect: Some(name.clone()),
                            ..TurnOn::default()
                        })
                        .await?;
                    println!("Effect: {}", light.effect().unwrap_or(name));
                }

                Commands::Mode { mode } => {
                    coordinator.set_mode(mode).await?;
                    println!("Mode set to {mode}");
                }

                Commands::Watch { duration } => {
                    println!("Watching for {duration}s...");
                    coordinator.subscribe(|view| match view.state() {
                        Some(state) => println!(
                            "  counter {:>6}  {}  brightness {:.2}  available {}{}",
                            state.state_counter(),
                            if state.is_on() { "ON " } else { "OFF" },
                            state.brightness().value(),
                            view.available(),
                            if view.is_optimistic() { "  (optimistic)" } else { "" }
                        ),
                        None => println!("  no state, available {}", view.available()),
                    });
                    tokio::time::sleep(Duration::from_secs(duration)).await;
                }
            }
        }
    }

    hub.shutdown().await;
    Ok(())
}
