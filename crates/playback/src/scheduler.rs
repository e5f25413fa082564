use std::ops::ControlFlow;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

const PAUSED_POLL: Duration = Duration::from_millis(50);

pub enum Control {
    Pause,
    Resume,
    SetPeriod(Duration),
    Stop,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    /// Ticks that started after their deadline had already passed.
    pub overruns: u64,
}

/// Invokes a tick callback periodically. One callback runs to completion
/// before the next is considered; returning `Break` ends the run.
pub trait Scheduler {
    fn run(&mut self, tick: &mut dyn FnMut() -> ControlFlow<()>) -> RunSummary;
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: Sender<Control>,
}

impl SchedulerHandle {
    pub fn pause(&self) { let _ = self.tx.send(Control::Pause); }
    pub fn resume(&self) { let _ = self.tx.send(Control::Resume); }
    pub fn set_period(&self, period: Duration) { let _ = self.tx.send(Control::SetPeriod(period)); }
    pub fn stop(&self) { let _ = self.tx.send(Control::Stop); }
}

/// Deadline-paced scheduler on the calling thread. Late ticks are not
/// replayed in a burst; the schedule re-anchors at the late tick instead.
/// Controls take effect between ticks.
pub struct IntervalScheduler {
    period: Duration,
    paused: bool,
    rx: Receiver<Control>,
}

impl IntervalScheduler {
    pub fn new(period: Duration) -> (Self, SchedulerHandle) {
        let (tx, rx) = unbounded();
        (Self { period: clamp_period(period), paused: false, rx }, SchedulerHandle { tx })
    }

    pub fn period(&self) -> Duration { self.period }

    /// Returns false on `Stop`.
    fn apply(&mut self, control: Control) -> bool {
        match control {
            Control::Pause => self.paused = true,
            Control::Resume => self.paused = false,
            Control::SetPeriod(p) => self.period = clamp_period(p),
            Control::Stop => return false,
        }
        true
    }
}

fn clamp_period(p: Duration) -> Duration { p.max(Duration::from_millis(1)) }

impl Scheduler for IntervalScheduler {
    fn run(&mut self, tick: &mut dyn FnMut() -> ControlFlow<()>) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut controls_open = true;
        let mut next = Instant::now();
        loop {
            while controls_open {
                match self.rx.try_recv() {
                    Ok(c) => { if !self.apply(c) { return summary; } }
                    Err(crossbeam_channel::TryRecvError::Empty) => break,
                    Err(crossbeam_channel::TryRecvError::Disconnected) => controls_open = false,
                }
            }

            if self.paused {
                if !controls_open { return summary; }
                match self.rx.recv_timeout(PAUSED_POLL) {
                    Ok(c) => { if !self.apply(c) { return summary; } }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => controls_open = false,
                }
                next = Instant::now();
                continue;
            }

            let now = Instant::now();
            if now < next {
                if controls_open {
                    match self.rx.recv_timeout(next - now) {
                        Ok(c) => {
                            if !self.apply(c) { return summary; }
                            continue;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            controls_open = false;
                            continue;
                        }
                    }
                } else {
                    thread::sleep(next - now);
                }
            } else if summary.ticks > 0 && now > next + self.period {
                summary.overruns += 1;
                next = now;
            }

            summary.ticks += 1;
            if tick().is_break() { return summary; }
            next += self.period;
        }
    }
}

/// Runs ticks back to back without waiting, up to `max_ticks`.
pub struct StepScheduler {
    pub max_ticks: u64,
}

impl Scheduler for StepScheduler {
    fn run(&mut self, tick: &mut dyn FnMut() -> ControlFlow<()>) -> RunSummary {
        let mut summary = RunSummary::default();
        while summary.ticks < self.max_ticks {
            summary.ticks += 1;
            if tick().is_break() { break; }
        }
        summary
    }
}
