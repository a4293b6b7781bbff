// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
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

/// Overrides the configured render thread priority (0-99).
const PRIORITY_ENV: &str = "RTSAMPLER_THREAD_PRIORITY";

/// Set to opt out of SCHED_FIFO scheduling.
const DISABLE_RT_ENV: &str = "RTSAMPLER_DISABLE_RT_AUDIO";

/// The priority for render threads: the environment override if valid, otherwise
/// `configured`. Read once when a device starts, never on the render path.
pub fn render_thread_priority(configured: u8) -> Option<ThreadPriorityValue> {
    std::env::var(PRIORITY_ENV)
        .ok()
        .and_then(|value| {
            let priority = value.parse::<u8>().ok()?;
            (priority < 100).then(|| ThreadPriorityValue::try_from(priority).ok())?
        })
        .or_else(|| ThreadPriorityValue::try_from(configured.min(99)).ok())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| {
            value == "1"
                || value.eq_ignore_ascii_case("true")
                || value.eq_ignore_ascii_case("yes")
                || value.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

/// Whether render threads should ask for real-time scheduling.
pub fn rt_enabled() -> bool {
    !env_flag(DISABLE_RT_ENV)
}

/// Raises the calling thread's priority once. `priority_set` remembers whether
/// this already happened, so it is safe to call from every audio callback.
pub fn configure_thread_priority(
    priority: Option<ThreadPriorityValue>,
    rt: bool,
    priority_set: &mut bool,
) {
    if *priority_set {
        return;
    }
    *priority_set = true;
    let Some(priority) = priority else {
        return;
    };
    let priority = ThreadPriority::Crossplatform(priority);
    if let Err(e) = set_current_thread_priority(priority) {
        warn!(err = ?e, "Unable to raise render thread priority");
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
            Ok(()) => info!("Enabled SCHED_FIFO for render thread"),
            Err(e) => warn!(err = ?e, "Unable to enable SCHED_FIFO for render thread"),
        }
    }
    #[cfg(not(unix))]
    let _ = rt;
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_priority_env_override() {
        std::env::remove_var(PRIORITY_ENV);
        let expected = |value: u8| ThreadPriorityValue::try_from(value).ok();
        assert_eq!(render_thread_priority(70), expected(70));

        std::env::set_var(PRIORITY_ENV, "42");
        assert_eq!(render_thread_priority(70), expected(42));

        std::env::set_var(PRIORITY_ENV, "150");
        assert_eq!(render_thread_priority(70), expected(70));
        std::env::remove_var(PRIORITY_ENV);
    }

    #[test]
    #[serial]
    fn test_rt_opt_out() {
        std::env::remove_var(DISABLE_RT_ENV);
        assert!(rt_enabled());
        std::env::set_var(DISABLE_RT_ENV, "yes");
        assert!(!rt_enabled());
        std::env::remove_var(DISABLE_RT_ENV);
    }

    #[test]
    fn test_configures_only_once() {
        let mut priority_set = true;
        configure_thread_priority(ThreadPriorityValue::try_from(10u8).ok(), false, &mut priority_set);
        assert!(priority_set);

        let mut priority_set = false;
        configure_thread_priority(None, false, &mut priority_set);
        assert!(priority_set);
    }
}
