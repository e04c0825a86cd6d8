// Copyright (C) 2024 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{info, warn};

/// Priority for the simulated graph clock when KEYBRIDGE_THREAD_PRIORITY is unset.
const DEFAULT_CLOCK_PRIORITY: u8 = 70;

/// Reads KEYBRIDGE_THREAD_PRIORITY (0-99) once, before the clock starts, so the hot loop never
/// touches the environment.
pub fn clock_priority() -> ThreadPriority {
    std::env::var("KEYBRIDGE_THREAD_PRIORITY")
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .filter(|n| *n < 100)
        .or(Some(DEFAULT_CLOCK_PRIORITY))
        .and_then(|n| ThreadPriorityValue::try_from(n).ok())
        .map(ThreadPriority::Crossplatform)
        .unwrap_or(ThreadPriority::Max)
}

pub(crate) fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| {
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

/// Whether to ask for SCHED_FIFO on the clock thread. Opt out with KEYBRIDGE_DISABLE_RT_AUDIO=1.
pub fn rt_enabled() -> bool {
    !env_flag("KEYBRIDGE_DISABLE_RT_AUDIO")
}

/// Raises the priority of the calling thread. Failures are logged and otherwise ignored.
pub fn configure_clock_thread(priority: ThreadPriority, rt: bool) {
    if let Err(e) = set_current_thread_priority(priority) {
        warn!(error = ?e, "Failed to raise clock thread priority");
    }

    #[cfg(unix)]
    if rt {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        match set_thread_priority_and_policy(
            thread_native_id(),
            priority,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => info!("Enabled RT SCHED_FIFO for clock thread"),
            Err(e) => warn!(error = ?e, "Failed to set RT SCHED_FIFO for clock thread"),
        }
    }
    #[cfg(not(unix))]
    let _ = rt;
}
