/// Kelly Criterion sizing for decimal-odds bets.
///
/// Standard formula:
///   f* = (b·p − q) / b
/// where
///   b  = net decimal odds (profit per unit staked, i.e. odds − 1)
///   p  = model probability that the driver wins
///   q  = 1 − p
///
/// A fractional multiplier (0 < multiplier ≤ 1) trades expected growth for
/// lower variance.

/// Fraction of the stake budget to put on a bet. `0.0` when there is no edge.
pub fn kelly_fraction(win_prob: f64, decimal_odds: f64, multiplier: f64) -> f64 {
    if decimal_odds <= 1.0 || !(0.0..=1.0).contains(&win_prob) {
        return 0.0;
    }
    let b = decimal_odds - 1.0;
    let f = (b * win_prob - (1.0 - win_prob)) / b;
    if f <= 0.0 {
        return 0.0;
    }
    (f * multiplier).clamp(0.0, 1.0)
}

/// Expected profit of staking `stake` at `decimal_odds`:
/// p·(odds − 1)·stake − (1 − p)·stake.
pub fn expected_value(win_prob: f64, decimal_odds: f64, stake: f64) -> f64 {
    win_prob * (decimal_odds - 1.0) * stake - (1.0 - win_prob) * stake
}

/// Probability implied by a decimal price, before overround removal.
pub fn implied_probability(decimal_odds: f64) -> f64 {
    if decimal_odds <= 0.0 {
        return 0.0;
    }
    1.0 / decimal_odds
}
