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
use std::thread;
use std::time::{Duration, Instant};

/// Waits for `predicate` to return true, backing off between polls, and panics
/// with `error_msg` after ten seconds.
pub fn eventually<F>(predicate: F, error_msg: &str)
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let timeout = Duration::from_secs(10);
    let max_tick = Duration::from_millis(100);
    let mut tick = Duration::from_millis(1);

    loop {
        if predicate() {
            return;
        }
        if start.elapsed() > timeout {
            panic!("{}", error_msg);
        }
        thread::sleep(tick);
        tick = (tick * 2).min(max_tick);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_eventually_polls_until_true() {
        let polls = AtomicUsize::new(0);
        eventually(
            || polls.fetch_add(1, Ordering::Relaxed) >= 3,
            "predicate never became true",
        );
        assert_eq!(polls.load(Ordering::Relaxed), 4);
    }
}
