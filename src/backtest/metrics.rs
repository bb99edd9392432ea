//! Performance metrics from closed positions and the equity curve

use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;

use crate::portfolio::Position;
use crate::types::PerformanceMetrics;

/// Crypto markets trade every day
const TRADING_DAYS_PER_YEAR: f64 = 365.0;
const RISK_FREE_RATE: f64 = 0.05;

/// Last equity value of each UTC day
pub fn daily_equity(equity_curve: &[(DateTime<Utc>, f64)]) -> Vec<(NaiveDate, f64)> {
    equity_curve
        .iter()
        .chunk_by(|(ts, _)| ts.date_naive())
        .into_iter()
        .filter_map(|(day, group)| group.last().map(|(_, equity)| (day, *equity)))
        .collect()
}

pub fn max_drawdown(initial: f64, equity_curve: &[(DateTime<Utc>, f64)]) -> f64 {
    let mut peak = initial;
    let mut max_dd = 0.0;
    for (_, equity) in equity_curve {
        if *equity > peak {
            peak = *equity;
        }
        if peak > 0.0 {
            let dd = (peak - equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }
    max_dd
}

/// Annualized Sharpe ratio from daily returns.
///
/// The mean uses every day; volatility uses only days with a non-zero
/// return so flat days do not understate risk.
pub fn sharpe_ratio(daily: &[(NaiveDate, f64)]) -> f64 {
    let all_returns: Vec<f64> = daily
        .windows(2)
        .filter(|w| w[0].1 != 0.0)
        .map(|w| (w[1].1 - w[0].1) / w[0].1)
        .collect();
    if all_returns.is_empty() {
        return 0.0;
    }

    let active: Vec<f64> = all_returns.iter().copied().filter(|r| *r != 0.0).collect();
    let mean_return = all_returns.iter().sum::<f64>() / all_returns.len() as f64;
    let excess_return = mean_return - RISK_FREE_RATE / TRADING_DAYS_PER_YEAR;

    let n_active = active.len() as f64;
    let std_dev = if n_active > 1.0 {
        let active_mean = active.iter().sum::<f64>() / n_active;
        let variance =
            active.iter().map(|r| (r - active_mean).powi(2)).sum::<f64>() / (n_active - 1.0);
        variance.sqrt()
    } else {
        0.0
    };

    if std_dev > 0.0 {
        excess_return / std_dev * TRADING_DAYS_PER_YEAR.sqrt()
    } else {
        0.0
    }
}

pub fn calculate_metrics(
    initial_balance: f64,
    closed_positions: &[Position],
    equity_curve: &[(DateTime<Utc>, f64)],
) -> PerformanceMetrics {
    let Some(&(_, final_equity)) = equity_curve.last() else {
        return PerformanceMetrics::default();
    };

    let total_return = if initial_balance > 0.0 {
        (final_equity - initial_balance) / initial_balance * 100.0
    } else {
        0.0
    };

    let (winning, losing): (Vec<&Position>, Vec<&Position>) = closed_positions
        .iter()
        .partition(|p| p.realized_pnl > 0.0);

    let gross_profits: f64 = winning.iter().map(|p| p.realized_pnl).sum();
    let gross_losses: f64 = losing.iter().map(|p| p.realized_pnl.abs()).sum();

    let profit_factor = if gross_losses > 0.0 {
        gross_profits / gross_losses
    } else if gross_profits > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let win_rate = if closed_positions.is_empty() {
        0.0
    } else {
        winning.len() as f64 / closed_positions.len() as f64 * 100.0
    };

    let avg_win = if winning.is_empty() {
        0.0
    } else {
        gross_profits / winning.len() as f64
    };
    let avg_loss = if losing.is_empty() {
        0.0
    } else {
        gross_losses / losing.len() as f64
    };

    let largest_win = winning.iter().map(|p| p.realized_pnl).fold(0.0, f64::max);
    let largest_loss = losing.iter().map(|p| p.realized_pnl).fold(0.0, f64::min);

    let max_dd = max_drawdown(initial_balance, equity_curve);
    let daily = daily_equity(equity_curve);

    let calmar_ratio = match (daily.first(), daily.last()) {
        (Some((start, _)), Some((end, _))) if max_dd > 0.0 => {
            let duration_days = (*end - *start).num_days() as f64;
            if duration_days > 0.0 {
                let years = duration_days / TRADING_DAYS_PER_YEAR;
                let annualized = (1.0 + total_return / 100.0).powf(1.0 / years) - 1.0;
                annualized / max_dd
            } else {
                0.0
            }
        }
        _ => 0.0,
    };

    PerformanceMetrics {
        total_return,
        sharpe_ratio: sharpe_ratio(&daily),
        calmar_ratio,
        max_drawdown: max_dd * 100.0,
        win_rate,
        profit_factor,
        total_trades: closed_positions.len(),
        winning_trades: winning.len(),
        losing_trades: losing.len(),
        avg_win,
        avg_loss,
        largest_win,
        largest_loss,
        total_commission: closed_positions.iter().map(|p| p.commissions).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn curve(values: &[f64], step: Duration) -> Vec<(DateTime<Utc>, f64)> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (start + step * i as i32, *v))
            .collect()
    }

    #[test]
    fn test_daily_equity_takes_last_value() {
        let c = curve(&[100.0, 101.0, 102.0, 103.0], Duration::hours(12));
        let daily = daily_equity(&c);
        assert_eq!(daily.len(), 2);
        assert_eq!(daily[0].1, 101.0);
        assert_eq!(daily[1].1, 103.0);
    }

    #[test]
    fn test_max_drawdown() {
        let c = curve(&[100.0, 120.0, 90.0, 130.0], Duration::days(1));
        assert_relative_eq!(max_drawdown(100.0, &c), 0.25);
    }

    #[test]
    fn test_sharpe_ignores_flat_days_for_volatility() {
        let mut values = vec![100.0];
        for i in 0..60 {
            let last = *values.last().unwrap();
            let next = match i % 3 {
                0 => last * 1.02,
                1 => last * 0.99,
                _ => last,
            };
            values.push(next);
        }
        let daily = daily_equity(&curve(&values, Duration::days(1)));
        let sharpe = sharpe_ratio(&daily);
        assert!(sharpe > 0.0);

        // No movement at all gives zero rather than a division by zero
        let flat = daily_equity(&curve(&[100.0; 10], Duration::days(1)));
        assert_eq!(sharpe_ratio(&flat), 0.0);
    }

    #[test]
    fn test_empty_curve_gives_defaults() {
        let metrics = calculate_metrics(100.0, &[], &[]);
        assert_eq!(metrics.total_trades, 0);
        assert_eq!(metrics.total_return, 0.0);
    }
}
