use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::types::TriggerKind;

const WARNING_LEAD_MINUTES: u32 = 59;
const MIN_REPORT_DELAY_HOURS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("hour {0} is out of range (0-23)")]
    HourOutOfRange(u8),
    #[error("report delay must be 2-23 hours, got {0}")]
    ReportDelayOutOfRange(u8),
    #[error(
        "{first:02}:00 and {second:02}:00 must be more than {delay} hours apart so each window is reported before the next opens"
    )]
    WindowsOverlap { first: u8, second: u8, delay: u8 },
}

/// Distinct hours must be more than `report_delay_hours` apart around the
/// clock, so every window is reported before the next one opens. Repeated
/// hours collapse into one window.
pub fn validate_schedule(hours: [u8; 3], report_delay_hours: u8) -> Result<(), ScheduleError> {
    if !(MIN_REPORT_DELAY_HOURS..24).contains(&report_delay_hours) {
        return Err(ScheduleError::ReportDelayOutOfRange(report_delay_hours));
    }
    if let Some(bad) = hours.iter().find(|h| **h > 23) {
        return Err(ScheduleError::HourOutOfRange(*bad));
    }
    for (i, &first) in hours.iter().enumerate() {
        for &second in &hours[i + 1..] {
            if first == second {
                continue;
            }
            let apart = first.abs_diff(second);
            if apart.min(24 - apart) <= report_delay_hours {
                return Err(ScheduleError::WindowsOverlap {
                    first: first.min(second),
                    second: first.max(second),
                    delay: report_delay_hours,
                });
            }
        }
    }
    Ok(())
}

/// A daily firing at `hour:minute` UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTrigger {
    pub kind: TriggerKind,
    pub hour: u32,
    pub minute: u32,
}

/// Four triggers per configured hour: a warning 59 minutes before, the open
/// at the top of the hour, the lock an hour later and the report after
/// `report_delay_hours`. Identical entries are collapsed.
pub fn derive_triggers(hours: [u8; 3], report_delay_hours: u8) -> Vec<ScheduledTrigger> {
    let mut out: Vec<ScheduledTrigger> = Vec::new();
    for hour in hours.map(|h| u32::from(h) % 24) {
        let warning_total = (hour * 60 + 24 * 60 - WARNING_LEAD_MINUTES) % (24 * 60);
        let derived = [
            ScheduledTrigger {
                kind: TriggerKind::Warning,
                hour: warning_total / 60,
                minute: warning_total % 60,
            },
            ScheduledTrigger {
                kind: TriggerKind::Open,
                hour,
                minute: 0,
            },
            ScheduledTrigger {
                kind: TriggerKind::Lock,
                hour: (hour + 1) % 24,
                minute: 0,
            },
            ScheduledTrigger {
                kind: TriggerKind::Report,
                hour: (hour + u32::from(report_delay_hours)) % 24,
                minute: 0,
            },
        ];
        for trigger in derived {
            if !out.contains(&trigger) {
                out.push(trigger);
            }
        }
    }
    out
}

/// Next instant strictly after `now` that falls on `hour:minute` UTC.
pub fn next_fire(now: DateTime<Utc>, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let today = now.date_naive().and_hms_opt(hour, minute, 0)?.and_utc();
    if today > now {
        Some(today)
    } else {
        Some(today + TimeDelta::days(1))
    }
}

/// Owns the running timer tasks. Replacing the schedule stops every old timer
/// before any new one starts.
pub struct Scheduler {
    tx: mpsc::Sender<TriggerKind>,
    report_delay_hours: u8,
    handles: Vec<JoinHandle<()>>,
    active: Vec<ScheduledTrigger>,
}

impl Scheduler {
    pub fn new(tx: mpsc::Sender<TriggerKind>, report_delay_hours: u8) -> Self {
        Self {
            tx,
            report_delay_hours,
            handles: Vec::new(),
            active: Vec::new(),
        }
    }

    pub fn report_delay_hours(&self) -> u8 {
        self.report_delay_hours
    }

    #[cfg(test)]
    pub fn active(&self) -> &[ScheduledTrigger] {
        &self.active
    }

    pub fn replace(&mut self, hours: [u8; 3]) -> &[ScheduledTrigger] {
        self.stop_all();
        self.active = derive_triggers(hours, self.report_delay_hours);
        for trigger in self.active.clone() {
            let tx = self.tx.clone();
            self.handles.push(tokio::spawn(run_trigger(trigger, tx)));
        }
        info!(?hours, triggers = self.active.len(), "schedule installed");
        &self.active
    }

    pub fn stop_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        self.active.clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn run_trigger(trigger: ScheduledTrigger, tx: mpsc::Sender<TriggerKind>) {
    loop {
        let now = Utc::now();
        let Some(at) = next_fire(now, trigger.hour, trigger.minute) else {
            warn!(?trigger, "trigger time is not representable");
            return;
        };
        let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
        debug!(kind = trigger.kind.as_str(), at = %at, "timer armed");
        tokio::time::sleep(wait).await;
        if tx.send(trigger.kind).await.is_err() {
            return;
        }
    }
}
