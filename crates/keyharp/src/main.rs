// keyharp — main binary.
//
// Wires the pipeline together: config, keybindings, scheduler worker,
// playback scheduler, clock synchronizer, MIDI devices, and the control
// surface.

mod devices;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use keyharp_config::Config;
use keyharp_control::{
    BankCommand, ControlCommand, ControlServer, LoadCommand, OffsetCommand, PatchCommand,
    ScheduleCommand, StatusCommand, SyncTimeCommand, TrackCommand, TransposeCommand,
};
use keyharp_core::clock::{ClockSync, SharedClock, SntpTimeSource};
use keyharp_core::inject::TraceInjector;
use keyharp_core::pipeline::Pipeline;
use keyharp_core::playback::PlaybackScheduler;
use keyharp_core::shutdown::Shutdown;
use keyharp_core::worker::{Worker, WorkerConfig};

use devices::{DeviceManager, InputDeviceCommand, OutputDeviceCommand, SharedMidiOut};

#[derive(Parser, Debug)]
#[command(name = "keyharp", about = "MIDI to keystroke performance bridge")]
struct Args {
    /// Path to the config JSON file.
    #[arg(long, default_value = "keyharp.json")]
    config: PathBuf,

    /// List MIDI devices and exit.
    #[arg(long)]
    list_devices: bool,

    /// MIDI input device index to open at startup.
    #[arg(long)]
    input_device: Option<usize>,

    /// MIDI output device index to open at startup.
    #[arg(long)]
    output_device: Option<usize>,

    /// Override the control listen address from the config.
    #[arg(long)]
    control_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.list_devices {
        for (i, name) in DeviceManager::list_inputs()?.iter().enumerate() {
            println!("input  {i}: {name}");
        }
        for (i, name) in DeviceManager::list_outputs()?.iter().enumerate() {
            println!("output {i}: {name}");
        }
        return Ok(());
    }

    let config = match Config::read(&args.config) {
        Ok(config) => {
            info!(path = %args.config.display(), "loaded config");
            config
        }
        Err(_) => {
            info!(path = %args.config.display(), "unable to load config, default settings applied");
            Config::default()
        }
    };
    let bindings = Arc::new(config.keybinding_table()?);
    info!(mapped = bindings.mapped_count(), "keybindings loaded");

    let pipeline = Pipeline::new(&config, bindings);
    let shutdown = Shutdown::new();
    let midi_out = SharedMidiOut::new();

    let worker = Worker::new(
        pipeline.clone(),
        WorkerConfig::from_config(&config),
        Box::new(TraceInjector),
        Box::new(midi_out.clone()),
        shutdown.clone(),
    );
    let worker_thread = thread::spawn(move || worker.run());

    let clock = SharedClock::new();
    let (playback, scheduler) = PlaybackScheduler::new(pipeline.clone(), clock.clone());
    thread::spawn(move || scheduler.run());

    let manager = Arc::new(Mutex::new(DeviceManager::new(
        pipeline.clone(),
        midi_out,
    )));
    if let Some(index) = args.input_device
        && let Err(e) = manager.lock().unwrap().open_input(index)
    {
        warn!("input device {index}: {e}");
    }
    if let Some(index) = args.output_device
        && let Err(e) = manager.lock().unwrap().open_output(index)
    {
        warn!("output device {index}: {e}");
    }

    let sync = Arc::new(ClockSync::new(
        clock,
        Box::new(SntpTimeSource::new(config.ntp_sync_timeout())),
        config.ntp_cooldown(),
    ));

    let commands: Vec<Arc<dyn ControlCommand>> = vec![
        Arc::new(TransposeCommand {
            pipeline: pipeline.clone(),
        }),
        Arc::new(BankCommand {
            pipeline: pipeline.clone(),
        }),
        Arc::new(PatchCommand {
            pipeline: pipeline.clone(),
        }),
        Arc::new(TrackCommand {
            playback: playback.clone(),
        }),
        Arc::new(OffsetCommand {
            playback: playback.clone(),
        }),
        Arc::new(ScheduleCommand {
            playback: playback.clone(),
        }),
        Arc::new(LoadCommand {
            playback: playback.clone(),
        }),
        Arc::new(StatusCommand {
            playback: playback.clone(),
        }),
        Arc::new(SyncTimeCommand {
            sync,
            default_server: config.ntp_server.clone(),
        }),
        Arc::new(InputDeviceCommand {
            manager: manager.clone(),
        }),
        Arc::new(OutputDeviceCommand {
            manager: manager.clone(),
        }),
    ];
    let mut server = ControlServer::new(commands);
    let addr = args
        .control_addr
        .unwrap_or_else(|| config.control_listen_addr.clone());
    server.start(addr);

    info!("keyharp running, ctrl-c to quit");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    server.stop();
    manager.lock().unwrap().close_input();
    shutdown.trigger();
    pipeline.queue().close();
    // The worker finishes any in-flight batch before stopping.
    let _ = worker_thread.join();
    manager.lock().unwrap().close_output();

    Ok(())
}
