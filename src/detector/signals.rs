//! Pure signal functions behind the movement classifier. Nothing here touches
//! storage or fails: missing inputs degrade to a neutral signal.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::ClassifierPolicy;
use crate::types::{MarketFamily, OddsHistoryRecord, VolumeDirection};

/// Counter-public price patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    FavouriteDrifting,
    UnderdogBacked,
    UnderShortening,
    DrawShortening,
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Pattern::FavouriteDrifting => "favourite drifting",
            Pattern::UnderdogBacked => "underdog backed",
            Pattern::UnderShortening => "under shortening",
            Pattern::DrawShortening => "draw shortening",
        };
        write!(f, "{s}")
    }
}

pub fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Step function of minutes to kickoff. Live or past kickoff counts as closest.
pub fn time_proximity(minutes_to_kickoff: Option<i64>) -> f64 {
    match minutes_to_kickoff {
        None => 0.0,
        Some(m) if m <= 0 => 1.0,
        Some(m) if m <= 60 => 0.9,
        Some(m) if m <= 180 => 0.8,
        Some(m) if m <= 360 => 0.7,
        Some(m) if m <= 720 => 0.6,
        Some(m) if m <= 1440 => 0.5,
        Some(_) => 0.3,
    }
}

pub fn magnitude_score(change_pct: f64, multiplier: f64, p: &ClassifierPolicy) -> f64 {
    let pct = change_pct.abs();
    let mut score = if pct >= p.large_move_pct {
        p.large_move_bonus
    } else if pct >= p.medium_move_pct {
        p.medium_move_bonus
    } else {
        0.0
    };
    score += if multiplier >= p.large_multiplier {
        p.large_multiplier_bonus
    } else if multiplier >= p.medium_multiplier {
        p.medium_multiplier_bonus
    } else {
        0.0
    };
    score
}

fn is_under(outcome: &str) -> bool {
    outcome.trim().to_lowercase().starts_with("under")
}

fn is_draw(outcome: &str) -> bool {
    let o = outcome.trim().to_lowercase();
    o == "draw" || o == "x" || o.starts_with("draw ")
}

/// Every counter-public pattern the move matches.
pub fn patterns(
    family: Option<MarketFamily>,
    outcome: &str,
    previous: f64,
    change: f64,
    p: &ClassifierPolicy,
) -> Vec<Pattern> {
    let mut out = Vec::new();
    let lengthened = change > 0.0;
    let shortened = change < 0.0;

    if lengthened && previous > 0.0 && previous < p.favourite_max_odds {
        out.push(Pattern::FavouriteDrifting);
    }
    if shortened && previous >= p.underdog_min_odds {
        out.push(Pattern::UnderdogBacked);
    }
    if shortened && family == Some(MarketFamily::OverUnder) && is_under(outcome) {
        out.push(Pattern::UnderShortening);
    }
    if shortened && family == Some(MarketFamily::MatchResult) && is_draw(outcome) {
        out.push(Pattern::DrawShortening);
    }
    out
}

/// Public share on the outcome against the direction of the price move.
///
/// Heavy public money while the price lengthens, or little public money while
/// it shortens, means the book is moving against the crowd.
pub fn volume_direction(bet_pct: Option<Decimal>, change: Decimal, p: &ClassifierPolicy) -> VolumeDirection {
    let Some(pct) = bet_pct.map(to_f64) else {
        return VolumeDirection::Neutral;
    };
    let lengthened = change > Decimal::ZERO;
    let shortened = change < Decimal::ZERO;
    let heavy = pct >= p.heavy_public_pct;
    let light = pct <= p.light_public_pct;

    if (heavy && lengthened) || (light && shortened) {
        VolumeDirection::AgainstMovement
    } else if (heavy && shortened) || (light && lengthened) {
        VolumeDirection::WithMovement
    } else {
        VolumeDirection::Neutral
    }
}

/// Bet share minus implied probability, in percentage points.
pub fn public_bias(bet_pct: Option<Decimal>, implied_probability: Option<Decimal>) -> Option<f64> {
    Some(to_f64(bet_pct?) - to_f64(implied_probability?))
}

/// Qualifying moves in `history` going the same way as `change`. The caller
/// supplies rows already restricted to the steam window.
pub fn steam_moves(history: &[OddsHistoryRecord], change: Decimal, p: &ClassifierPolicy) -> usize {
    let up = change > Decimal::ZERO;
    history
        .iter()
        .filter(|h| h.change != Decimal::ZERO && (h.change > Decimal::ZERO) == up)
        .filter(|h| to_f64(h.change_pct).abs() >= p.steam_min_move_pct)
        .count()
}

pub fn steam_confidence(moves: usize) -> f64 {
    if moves > 5 {
        0.8
    } else if moves > 3 {
        0.7
    } else {
        0.5
    }
}
