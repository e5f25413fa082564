use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use device::{DeviceChannel, LoopbackLink};
use playback::Sampler;
use stimulus::{CommandMapper, DeviceCommand};
use tracing_subscriber::EnvFilter;

mod controls;
mod play;

use project::AppConfig;

#[derive(Parser)]
#[command(name = "thermo-cli", about = "Play annotated videos through a thermal stimulus device")]
struct Cli {
    /// Config file (defaults to the per-user config location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Raise the default log level to debug
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
pub struct DeviceArgs {
    /// Serial port; the first detected port when omitted
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    baud: Option<u32>,
    /// Use an in-process echoing link instead of hardware
    #[arg(long)]
    emulate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,
    /// Send one command such as `h200` and wait for the echo
    Send {
        command: String,
        #[command(flatten)]
        device: DeviceArgs,
        /// How long to wait for a response line
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
    },
    /// Play a video and drive the device from its annotations
    Play(play::PlayArgs),
    /// Concatenate videos and their annotation files
    Merge {
        #[arg(long = "video", required = true)]
        videos: Vec<PathBuf>,
        #[arg(long = "annotations", required = true)]
        annotations: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        /// Defaults to the output video path with a .json extension
        #[arg(long)]
        out_annotations: Option<PathBuf>,
    },
    /// Summarize an annotation file
    Inspect {
        file: PathBuf,
        /// Show the record and command for this frame
        #[arg(long)]
        frame: Option<u64>,
    },
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write the default configuration
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default = if verbose > 0 { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config_path = cli.config.clone().unwrap_or_else(project::default_config_path);

    if let Commands::Config(cmd) = &cli.command {
        return config_command(cmd, &config_path);
    }
    let config = AppConfig::load_or_default(&config_path).with_context(|| format!("loading {}", config_path.display()))?;

    match cli.command {
        Commands::Ports => ports(),
        Commands::Send { command, device, wait_ms } => send(&config, &device, &command, Duration::from_millis(wait_ms)),
        Commands::Play(args) => play::run(config, args),
        Commands::Merge { videos, annotations, output, out_annotations } => {
            let out_annotations = out_annotations.unwrap_or_else(|| output.with_extension("json"));
            merge_command(videos, annotations, &output, &out_annotations)
        }
        Commands::Inspect { file, frame } => inspect(&config, &file, frame),
        Commands::Config(_) => Ok(()),
    }
}

/// Opens the device the way the flags ask. Without `--emulate` a failed
/// connection leaves the channel closed rather than aborting.
pub fn open_device(config: &AppConfig, args: &DeviceArgs) -> DeviceChannel {
    let mut serial = config.serial.clone();
    if args.port.is_some() { serial.port = args.port.clone(); }
    if let Some(baud) = args.baud { serial.baud_rate = baud; }
    let mut channel = DeviceChannel::new(serial);
    if args.emulate {
        channel.attach(Box::new(LoopbackLink::new("emulated")));
    } else {
        channel.connect();
    }
    channel
}

fn ports() -> Result<()> {
    let ports = device::discover_ports();
    if ports.is_empty() {
        println!("no serial devices detected");
    }
    for p in ports {
        println!("{}\t{}", p.name, p.description);
    }
    Ok(())
}

fn send(config: &AppConfig, args: &DeviceArgs, text: &str, wait: Duration) -> Result<()> {
    let command: DeviceCommand = text.parse().with_context(|| format!("invalid command {text:?}"))?;
    let mut channel = open_device(config, args);
    if !channel.is_open() { bail!("no device connected"); }
    channel.send(&command).context("sending command")?;
    let deadline = Instant::now() + wait;
    loop {
        if let Some(line) = channel.try_read() {
            println!("{line}");
            return Ok(());
        }
        if Instant::now() >= deadline { break; }
        thread::sleep(Duration::from_millis(10));
    }
    println!("sent {command}, no response within {} ms", wait.as_millis());
    Ok(())
}

fn merge_command(videos: Vec<PathBuf>, annotations: Vec<PathBuf>, output: &Path, out_annotations: &Path) -> Result<()> {
    let inputs = merge::pair_inputs(videos, annotations)?;
    let summary = merge::merge(&inputs, output, out_annotations, |event| match event {
        merge::MergeEvent::SegmentStarted { index, video } => eprintln!("[{}/{}] {video}", index + 1, inputs.len()),
        merge::MergeEvent::SegmentFinished { frames, .. } => eprintln!("    {frames} frames"),
        merge::MergeEvent::AnnotationsWritten { records } => eprintln!("wrote {records} records to {}", out_annotations.display()),
    })?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn inspect(config: &AppConfig, file: &Path, frame: Option<u64>) -> Result<()> {
    let set = annotations::AnnotationSet::try_load(file)?;
    let stimuli = set.records().iter().filter(|r| !r.annotation().is_none()).count();
    println!("records:   {}", set.len());
    match set.frame_range() {
        Some((first, last)) => println!("frames:    {first}..={last}"),
        None => println!("frames:    -"),
    }
    println!("stimulus:  {stimuli}");
    println!("sentinel:  {}", set.len() - stimuli);

    if let Some(frame) = frame {
        // same lookup and mapping the player runs on each tick
        let sampler = Sampler::new(set, CommandMapper::new(config.mapping));
        let Some(annotation) = sampler.annotations().annotation_at(frame) else {
            println!("frame {frame}: no record");
            return Ok(());
        };
        println!("frame {frame}: {}", serde_json::to_string(&annotation)?);
        match sampler.command_at(frame) {
            Some(cmd) => println!("command:   {cmd}"),
            None => println!("command:   none"),
        }
    }
    Ok(())
}

fn config_command(cmd: &ConfigCommand, path: &Path) -> Result<()> {
    match cmd {
        ConfigCommand::Path => println!("{}", path.display()),
        ConfigCommand::Show => {
            let config = AppConfig::load_or_default(path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force { bail!("{} already exists (use --force to overwrite)", path.display()); }
            AppConfig::default().save(path)?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}
