//! Loop/capture state derivation.
//!
//! The current lap number, whether a lap is open, and which points were
//! captured in the current lap are never stored — they are recomputed
//! from the ordered stamp list alone, so a page reload mid-lap rebuilds
//! identical state.

use std::collections::BTreeSet;

use crate::types::Stamp;

/// Derived lap state for a session's stamp list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    /// Current lap number, 1-based
    pub loop_index: u32,
    /// True while a lap is open (Start seen without a matching Stop)
    pub loop_open: bool,
    /// ZUPT names captured since the current lap opened
    pub captured: BTreeSet<String>,
}

impl Default for LoopState {
    fn default() -> Self {
        LoopState {
            loop_index: 1,
            loop_open: false,
            captured: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LapMarker {
    Start,
    Stop,
}

/// Parse "L<N> Start" / "L<N> Stop" (case-insensitive). Returns None for
/// anything else, including manual notes and ZUPT captures.
fn parse_lap_marker(name: &str) -> Option<(u32, LapMarker)> {
    let rest = name.strip_prefix('L').or_else(|| name.strip_prefix('l'))?;
    let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
    if digits_end == 0 {
        return None;
    }
    let lap: u32 = rest[..digits_end].parse().ok()?;
    let suffix = rest[digits_end..].trim();
    if suffix.eq_ignore_ascii_case("start") {
        Some((lap, LapMarker::Start))
    } else if suffix.eq_ignore_ascii_case("stop") {
        Some((lap, LapMarker::Stop))
    } else {
        None
    }
}

/// Reconstruct lap state from a session's ordered stamp list.
///
/// The lap number is the greatest N seen in any Start marker; a lap is
/// open iff no Stop for that N exists anywhere in the list. When a lap
/// for N is re-opened after its Stop, the highest lap number still wins
/// regardless of stamp order.
pub fn derive_loop_state(stamps: &[Stamp]) -> LoopState {
    let mut max_start: Option<u32> = None;
    for stamp in stamps {
        if let Some((lap, LapMarker::Start)) = parse_lap_marker(&stamp.zupt_name) {
            max_start = Some(max_start.map_or(lap, |m| m.max(lap)));
        }
    }

    let Some(max_start) = max_start else {
        return LoopState::default();
    };

    let stopped = stamps.iter().any(|s| {
        matches!(parse_lap_marker(&s.zupt_name), Some((lap, LapMarker::Stop)) if lap == max_start)
    });

    // Stamps strictly after the last "L<max> Start" belong to the current
    // lap; markers and manual notes are excluded from capture bookkeeping.
    let last_start = stamps.iter().rposition(|s| {
        matches!(parse_lap_marker(&s.zupt_name), Some((lap, LapMarker::Start)) if lap == max_start)
    });
    let mut captured = BTreeSet::new();
    if let Some(idx) = last_start {
        for stamp in &stamps[idx + 1..] {
            if parse_lap_marker(&stamp.zupt_name).is_some() || stamp.is_manual_note() {
                continue;
            }
            captured.insert(stamp.zupt_name.clone());
        }
    }

    LoopState {
        loop_index: if stopped { max_start + 1 } else { max_start },
        loop_open: !stopped,
        captured,
    }
}
