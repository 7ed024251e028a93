//! Track scoring.
//!
//! Every recompute pass feeds each track's [`PlayInfo`] and the previous
//! pass's [`LibraryStats`] through [`compute_score`]. The result is a
//! rich-get-poorer dynamic:
//!
//! - brand-new tracks are scattered across the score range by jitter,
//! - tracks skipped since the last pass lose `15 * (1 + consecutive skips)`,
//! - tracks left unplayed across passes gain `15 * passes since play`,
//! - tracks played since the last pass decay halfway back to the average.
//!
//! The function is pure apart from the random terms, which come from the
//! caller-supplied RNG so tests can seed it.

use crate::library::{LibraryStats, PlayInfo};
use rand::Rng;
use std::time::SystemTime;

/// Tunable weights for the scoring pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringContext {
    /// Base penalty per skip, multiplied by `1 + consecutive_skips`.
    pub skip_penalty: f64,
    /// Extra penalty for tracks skipped more often than the library average.
    pub habitual_skip_penalty: f64,
    /// Flat bonus for every track not skipped since the last pass.
    pub attrition_bonus: f64,
    /// Bonus per pass a track has gone without being played.
    pub neglect_bonus: f64,
    /// Exclusive upper bound of the tie-breaking jitter.
    pub tie_break_span: u32,
}

impl Default for ScoringContext {
    fn default() -> Self {
        Self {
            skip_penalty: 15.0,
            habitual_skip_penalty: 15.0,
            attrition_bonus: 5.0,
            neglect_bonus: 15.0,
            tie_break_span: 5,
        }
    }
}

/// Returns true when `a` is strictly later than `b`.
///
/// An absent timestamp orders before every present one, so a track that was
/// never played counts as "played before" any recompute.
#[must_use]
pub fn is_after(a: Option<SystemTime>, b: Option<SystemTime>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// True for a track that has never been scored and has no history at all.
#[must_use]
pub fn is_unscored(info: &PlayInfo) -> bool {
    info.score == 0.0 && info.total_plays == 0 && info.total_skips == 0
}

/// Compute the next [`PlayInfo`] for a track using the default weights.
///
/// `track_count` is the size of the corpus being scored; it bounds the
/// placement jitter given to never-scored tracks.
///
/// # Examples
///
/// ```
/// use rand::{rngs::StdRng, SeedableRng};
/// use rotation::algorithm::compute_score;
/// use rotation::library::{LibraryStats, PlayInfo};
///
/// let mut rng = StdRng::seed_from_u64(7);
/// let next = compute_score(&PlayInfo::default(), &LibraryStats::default(), 10, &mut rng);
/// assert!(next.score >= 0.0 && next.score < 15.0);
/// ```
#[must_use]
pub fn compute_score<R: Rng + ?Sized>(
    info: &PlayInfo,
    stats: &LibraryStats,
    track_count: usize,
    rng: &mut R,
) -> PlayInfo {
    compute_score_with_context(info, stats, track_count, &ScoringContext::default(), rng)
}

/// Compute the next [`PlayInfo`] for a track.
///
/// The caller commits the returned value; nothing here touches shared state.
#[must_use]
pub fn compute_score_with_context<R: Rng + ?Sized>(
    info: &PlayInfo,
    stats: &LibraryStats,
    track_count: usize,
    context: &ScoringContext,
    rng: &mut R,
) -> PlayInfo {
    let mut next = info.clone();

    // Spread never-scored tracks over [0, track_count).
    if next.score == 0.0 && track_count > 0 {
        next.score += rng.gen_range(0..track_count) as f64;
    }

    if context.tie_break_span > 0 {
        next.score += f64::from(rng.gen_range(0..context.tie_break_span));
    }

    // A track with no history is placed by jitter alone.
    if is_unscored(info) {
        log::trace!("placed new track at {:.1}", next.score);
        return next;
    }

    if !apply_skip_score(&mut next, stats, context) {
        return next;
    }

    apply_play_score(&mut next, stats, context);
    next
}

/// Returns false when the track was skipped since the last pass, in which
/// case the play branch must not run.
fn apply_skip_score(info: &mut PlayInfo, stats: &LibraryStats, context: &ScoringContext) -> bool {
    if is_after(info.last_skipped_at, stats.last_compute_at) {
        info.score -= context.skip_penalty * (1.0 + f64::from(info.consecutive_skips));

        if info.total_skips > stats.avg_skips.floor() as u64 {
            info.score -= context.habitual_skip_penalty;
        }

        info.consecutive_skips = info.consecutive_skips.saturating_add(1);
        return false;
    }

    if is_after(info.last_played_at, info.last_skipped_at) {
        info.consecutive_skips = 0;
    }

    info.score += context.attrition_bonus;
    true
}

fn apply_play_score(info: &mut PlayInfo, stats: &LibraryStats, context: &ScoringContext) {
    if is_after(stats.last_compute_at, info.last_played_at) {
        info.recomputes_since_play = info.recomputes_since_play.saturating_add(1);
        info.score += context.neglect_bonus * f64::from(info.recomputes_since_play);
    }

    // Just played: pull it back toward the pack.
    if is_after(info.last_played_at, stats.last_compute_at) && info.score > stats.avg_score {
        info.score -= (info.score - stats.avg_score) / 2.0;
    }
}
