use crate::config::ClassifierPolicy;
use crate::detector::signals::{
    magnitude_score, patterns, public_bias, steam_confidence, steam_moves, time_proximity, to_f64,
    volume_direction, Pattern,
};
use crate::types::{AlertType, MarketFamily, OddsHistoryRecord, OutcomeDistribution, VolumeDirection};

/// Everything known about one recorded move at classification time.
#[derive(Debug, Clone, Copy)]
pub struct MovementContext<'a> {
    pub record: &'a OddsHistoryRecord,
    pub family: Option<MarketFamily>,
    pub distribution: Option<&'a OutcomeDistribution>,
    /// History on the same key inside the steam window, the record itself included.
    pub recent: &'a [OddsHistoryRecord],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub confidence: f64,
    pub direction: VolumeDirection,
    pub patterns: Vec<Pattern>,
    /// Bet share minus implied probability (pp), when both are known.
    pub bias: Option<f64>,
    pub reverse: bool,
    pub steam_moves: usize,
}

/// Score a move for informed-money characteristics. Confidence is clamped to [0, 1].
pub fn assess(ctx: &MovementContext<'_>, p: &ClassifierPolicy) -> Assessment {
    let r = ctx.record;
    let change_pct = to_f64(r.change_pct);
    let bet_pct = ctx.distribution.map(|d| d.bet_pct);

    let mut confidence = time_proximity(r.minutes_to_kickoff) * p.time_weight;
    confidence += magnitude_score(change_pct, to_f64(r.multiplier), p);

    let found = patterns(ctx.family, &r.outcome, to_f64(r.previous_value), to_f64(r.change), p);
    confidence += p.pattern_bonus * found.len() as f64;

    let direction = volume_direction(bet_pct, r.change, p);
    if direction == VolumeDirection::AgainstMovement {
        confidence += p.against_movement_bonus;
    }

    let bias = public_bias(bet_pct, ctx.distribution.and_then(|d| d.implied_probability));
    if bias.is_some_and(|b| b > p.public_bias_pp) {
        confidence += p.public_bias_bonus;
    }

    Assessment {
        confidence: confidence.clamp(0.0, 1.0),
        reverse: r.is_reverse_movement || direction == VolumeDirection::AgainstMovement,
        steam_moves: steam_moves(ctx.recent, r.change, p),
        direction,
        patterns: found,
        bias,
    }
}

/// Alert types the assessment triggers, each with the confidence it carries.
pub fn triggers(r: &OddsHistoryRecord, a: &Assessment, p: &ClassifierPolicy) -> Vec<(AlertType, f64)> {
    let mut out = Vec::new();
    if to_f64(r.change_pct).abs() >= p.big_mover_pct || to_f64(r.multiplier) >= p.big_mover_multiplier {
        out.push((AlertType::BigMover, a.confidence));
    }
    if a.reverse {
        out.push((AlertType::ReverseLine, a.confidence));
    }
    if a.confidence >= p.sharp_money_confidence {
        out.push((AlertType::SharpMoney, a.confidence));
    }
    if a.bias.is_some_and(|b| b > p.value_spot_bias_pp) {
        out.push((AlertType::ValueSpot, a.confidence));
    }
    if a.steam_moves > p.steam_min_moves {
        out.push((AlertType::SteamMove, steam_confidence(a.steam_moves)));
    }
    out
}
