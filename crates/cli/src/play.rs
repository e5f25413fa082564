use std::ops::ControlFlow;
use std::path::PathBuf;

use annotations::AnnotationSet;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use crossbeam_channel::unbounded;
use device::{DeviceStats, LoopbackLink};
use media_io::{FfmpegReader, FrameSource};
use playback::{
    Advance, DispatchRecord, EndOfStreamPolicy, IntervalScheduler, PlayState, Player, PlayerCommand, Sampler, Scheduler,
    SchedulerHandle,
};
use project::{AppConfig, VideoEntry, VideoLibrary};
use serde::Serialize;
use stimulus::CommandMapper;
use uuid::Uuid;

use crate::controls::{self, Input};
use crate::{open_device, DeviceArgs};

#[derive(Args)]
pub struct PlayArgs {
    /// Play this file instead of scanning the library
    #[arg(long)]
    video: Option<PathBuf>,
    /// Annotation file for `--video`; defaults to `<annotation dir>/<stem>.json`
    #[arg(long)]
    annotations: Option<PathBuf>,
    #[arg(long)]
    video_dir: Option<PathBuf>,
    #[arg(long)]
    annotation_dir: Option<PathBuf>,
    /// Position in the library (sorted by file name)
    #[arg(long, default_value_t = 0)]
    index: usize,
    #[command(flatten)]
    device: DeviceArgs,
    /// Stop at the end of the video instead of looping
    #[arg(long)]
    stop_at_end: bool,
    /// Write the session's dispatch history as JSON, to the given path or
    /// to the app data directory
    #[arg(long, num_args = 0..=1)]
    history: Option<Option<PathBuf>>,
}

#[derive(Serialize)]
struct VideoDispatches {
    video: String,
    dispatches: Vec<DispatchRecord>,
}

#[derive(Serialize)]
struct SessionLog {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    ticks: u64,
    overruns: u64,
    device: DeviceStats,
    videos: Vec<VideoDispatches>,
}

fn playlist(config: &AppConfig, args: &PlayArgs) -> Result<Vec<VideoEntry>> {
    let annotation_dir = args.annotation_dir.clone().unwrap_or_else(|| config.library.annotation_dir.clone());
    if let Some(video) = &args.video {
        let stem = video.file_stem().and_then(|s| s.to_str()).context("video path has no file name")?;
        let annotations = args.annotations.clone().unwrap_or_else(|| annotation_dir.join(format!("{stem}.json")));
        let name = video.file_name().and_then(|s| s.to_str()).unwrap_or(stem).to_string();
        return Ok(vec![VideoEntry { name, video: video.clone(), annotations }]);
    }
    let video_dir = args.video_dir.clone().unwrap_or_else(|| config.library.video_dir.clone());
    let library = VideoLibrary::scan(&video_dir, &annotation_dir)?;
    if library.is_empty() { bail!("no videos in {}", video_dir.display()); }
    Ok(library.entries().to_vec())
}

/// A missing or unreadable annotation file plays without stimuli.
fn open_entry(entry: &VideoEntry) -> Result<(FfmpegReader, AnnotationSet)> {
    let source = FfmpegReader::open(&entry.video).with_context(|| format!("opening {}", entry.video.display()))?;
    let annotations = AnnotationSet::load(&entry.annotations);
    tracing::info!(video = %entry.name, records = annotations.len(), fps = source.info().fps, "loaded video");
    Ok((source, annotations))
}

fn print_status(player: &Player<FfmpegReader>, entry: &VideoEntry) {
    let state = player.clock().playback_state();
    let conn = player.device().connection();
    eprintln!(
        "{} frame {}/{} @ {:.2} fps {:?} | device {} {:?}",
        entry.name,
        state.current_frame,
        player.clock().length().map_or_else(|| "?".to_string(), |n| n.to_string()),
        state.fps,
        player.clock().state(),
        conn.port_name.as_deref().unwrap_or("-"),
        player.device().stats(),
    );
}

struct Session {
    entries: Vec<VideoEntry>,
    current: usize,
    speed: f64,
    emulate: bool,
    history: Vec<VideoDispatches>,
}

impl Session {
    fn entry(&self) -> &VideoEntry { &self.entries[self.current] }

    fn retime(&self, player: &Player<FfmpegReader>, handle: &SchedulerHandle) {
        handle.set_period(player.clock().frame_interval().div_f64(self.speed));
    }

    fn bank_history(&mut self, player: &mut Player<FfmpegReader>) {
        let dispatches = player.sampler_mut().take_history();
        if !dispatches.is_empty() {
            self.history.push(VideoDispatches { video: self.entry().name.clone(), dispatches });
        }
    }

    fn switch(&mut self, player: &mut Player<FfmpegReader>, handle: &SchedulerHandle, step: isize) {
        let len = self.entries.len() as isize;
        let next = (self.current as isize + step).rem_euclid(len) as usize;
        let opened = open_entry(&self.entries[next]);
        let (source, annotations) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "cannot switch video");
                return;
            }
        };
        self.bank_history(player);
        self.current = next;
        if let Err(e) = player.load(source, annotations) {
            tracing::warn!(error = %e, "playback did not restart");
        }
        self.retime(player, handle);
    }

    /// Returns false when playback should end.
    fn on_input(&mut self, input: Input, player: &mut Player<FfmpegReader>, handle: &SchedulerHandle) -> bool {
        match input {
            Input::Quit => return false,
            Input::Status => print_status(player, self.entry()),
            Input::Speed(x) => {
                self.speed = x;
                self.retime(player, handle);
            }
            Input::Next => self.switch(player, handle, 1),
            Input::Prev => self.switch(player, handle, -1),
            Input::Player(PlayerCommand::Reconnect) if self.emulate => {
                player.device_mut().attach(Box::new(LoopbackLink::new("emulated")));
            }
            Input::Player(cmd) => {
                if let Err(e) = player.apply(cmd) { tracing::warn!(error = %e, "command ignored"); }
            }
        }
        true
    }
}

pub fn run(mut config: AppConfig, args: PlayArgs) -> Result<()> {
    if args.stop_at_end { config.playback.end_of_stream = EndOfStreamPolicy::Stop; }
    let entries = playlist(&config, &args)?;
    let Some(first) = entries.get(args.index) else {
        bail!("index {} out of range ({} videos)", args.index, entries.len());
    };
    let (source, annotations) = open_entry(first)?;

    let device = open_device(&config, &args.device);
    let mut sampler = Sampler::new(annotations, CommandMapper::new(config.mapping));
    if args.history.is_some() { sampler = sampler.with_history_limit(1 << 20); }
    let mut player = Player::new(source, sampler, device, config.playback);
    player.apply(PlayerCommand::Play)?;

    let (mut scheduler, handle) = IntervalScheduler::new(player.clock().frame_interval());
    let (tx, rx) = unbounded();
    controls::spawn_stdin_reader(tx);
    eprintln!("{}", controls::HELP);

    let session_id = Uuid::new_v4();
    let started_at = Utc::now();
    tracing::info!(session = %session_id, videos = entries.len(), "playback session started");

    let mut session = Session { entries, current: args.index, speed: 1.0, emulate: args.device.emulate, history: Vec::new() };
    let mut failure = None;
    let summary = scheduler.run(&mut || {
        while let Ok(input) = rx.try_recv() {
            if !session.on_input(input, &mut player, &handle) { return ControlFlow::Break(()); }
        }
        match player.tick() {
            Ok(tick) => match tick.advance {
                Advance::EndOfStream => ControlFlow::Break(()),
                Advance::Idle if player.clock().state() == PlayState::Closed => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            },
            Err(e) => {
                failure = Some(e);
                ControlFlow::Break(())
            }
        }
    });

    session.bank_history(&mut player);
    let stats = player.device().stats();
    let _ = player.shutdown();
    tracing::info!(session = %session_id, ticks = summary.ticks, overruns = summary.overruns, sent = stats.sent, dropped = stats.dropped, "playback session ended");

    if let Some(path) = &args.history {
        let path = path.clone().unwrap_or_else(|| project::history_dir().join(format!("session-{session_id}.json")));
        let log = SessionLog {
            session_id,
            started_at,
            finished_at: Utc::now(),
            ticks: summary.ticks,
            overruns: summary.overruns,
            device: stats,
            videos: session.history,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) { std::fs::create_dir_all(dir)?; }
        std::fs::write(&path, serde_json::to_string_pretty(&log)?).with_context(|| format!("writing {}", path.display()))?;
        eprintln!("history written to {}", path.display());
    }

    if let Some(e) = failure { return Err(e).context("playback stopped on a decode error"); }
    Ok(())
}
