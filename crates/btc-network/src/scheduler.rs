//! Periodic task table.
//!
//! The table is built once at startup from the configured periods and never
//! rebuilt: a zero period leaves the row out entirely, and the one-shot
//! autoexit row removes itself after firing. Periodic rows tick immediately
//! and then on every interval.

use serde::{Deserialize, Serialize};
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};

/// Intervals in milliseconds for each engine task; zero disables a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Periods {
    /// Ping every hand-shaken peer.
    pub ping: u64,
    /// Liveness sweep over the peer table.
    pub timeout_peers: u64,
    /// Header/block exchange with hand-shaken peers.
    pub data_exchange: u64,
    /// Recompute the IBD mode flag.
    pub reset_ibd_mode: u64,
    /// Human-readable status snapshot.
    pub print_status: u64,
    /// Ask the chain store to persist.
    pub save_chain: u64,
    /// One-shot stop of the whole loop; for tests and smoke runs.
    pub autoexit: u64,
}

impl Default for Periods {
    fn default() -> Self {
        Self {
            ping: 11_000,
            timeout_peers: 10_000,
            data_exchange: 1_000,
            reset_ibd_mode: 60_000,
            print_status: 2_000,
            save_chain: 120_000,
            autoexit: 30 * 60 * 1000,
        }
    }
}

/// Which periodic task fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    PingPeers,
    CheckConnectivity,
    ExchangeData,
    ResetIbdMode,
    PrintStatus,
    SaveChainData,
    Autoexit,
}

struct Row {
    task: Task,
    timer: Interval,
    one_shot: bool,
}

/// Drives the engine's periodic work.
pub struct Scheduler {
    rows: Vec<Row>,
}

impl Scheduler {
    /// Build the task table from the configured periods.
    pub fn new(periods: &Periods) -> Self {
        let table = [
            (Task::ExchangeData, periods.data_exchange, false),
            (Task::SaveChainData, periods.save_chain, false),
            (Task::Autoexit, periods.autoexit, true),
            (Task::ResetIbdMode, periods.reset_ibd_mode, false),
            (Task::CheckConnectivity, periods.timeout_peers, false),
            (Task::PingPeers, periods.ping, false),
            (Task::PrintStatus, periods.print_status, false),
        ];

        let mut rows = Vec::new();
        for (task, millis, one_shot) in table {
            if millis == 0 {
                continue;
            }
            let period = Duration::from_millis(millis);
            let mut timer = if one_shot {
                interval_at(Instant::now() + period, period)
            } else {
                interval(period)
            };
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            rows.push(Row {
                task,
                timer,
                one_shot,
            });
        }
        Self { rows }
    }

    /// No tasks will ever fire.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Wait for the next task to fire. Pends forever once the table is
    /// empty, which composes with `select!` in the engine loop.
    pub async fn next(&mut self) -> Task {
        let rows = &mut self.rows;
        poll_fn(|cx| {
            for i in 0..rows.len() {
                if rows[i].timer.poll_tick(cx).is_ready() {
                    let task = rows[i].task;
                    if rows[i].one_shot {
                        rows.remove(i);
                    }
                    return Poll::Ready(task);
                }
            }
            Poll::Pending
        })
        .await
    }
}
