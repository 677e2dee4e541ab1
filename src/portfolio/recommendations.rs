//! Threshold rules over per-holding metrics: recommendations with a health
//! score, and the alerts shown in the daily briefing.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::RecommendationConfig;
use crate::models::Country;

/// Everything the rules look at for one holding. Amounts are in the base currency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HoldingMetrics {
    pub symbol: String,
    pub name: Option<String>,
    pub country: Country,
    pub market_value: Decimal,
    pub cost_basis: Decimal,
    pub gain_pct: Decimal,
    pub day_change_pct: Decimal,
    pub allocation_pct: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    TakeProfit,
    Review,
    Rebalance,
    Watch,
}

/// Ordered most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    /// `None` for portfolio-wide items.
    pub symbol: Option<String>,
    pub title: String,
    pub description: String,
    pub metric: Decimal,
    pub metric_label: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecommendationCounts {
    pub take_profit: usize,
    pub review: usize,
    pub rebalance: usize,
    pub watch: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendationReport {
    pub recommendations: Vec<Recommendation>,
    pub health_score: u32,
    pub health_grade: &'static str,
    pub summary: RecommendationCounts,
}

impl RecommendationReport {
    pub fn empty() -> Self {
        Self {
            recommendations: Vec::new(),
            health_score: 100,
            health_grade: health_grade(100),
            summary: RecommendationCounts::default(),
        }
    }
}

pub fn health_grade(score: u32) -> &'static str {
    match score {
        90.. => "A",
        80..=89 => "B",
        70..=79 => "C",
        60..=69 => "D",
        _ => "F",
    }
}

/// Each point deducted costs 3 health points.
pub fn health_score(deductions: u32) -> u32 {
    100u32.saturating_sub(deductions.saturating_mul(3))
}

fn pct(value: Decimal) -> Decimal {
    value.round_dp(1)
}

pub fn recommend(holdings: &[HoldingMetrics], config: &RecommendationConfig) -> RecommendationReport {
    let mut items = Vec::new();
    let mut deductions = 0u32;

    for h in holdings {
        if h.gain_pct > config.take_profit_pct {
            let high = h.gain_pct > config.take_profit_high_pct;
            items.push(Recommendation {
                kind: RecommendationKind::TakeProfit,
                symbol: Some(h.symbol.clone()),
                title: format!("Consider taking profits on {}", h.symbol),
                description: format!(
                    "Up {}% from cost basis. Consider trimming position.",
                    pct(h.gain_pct)
                ),
                metric: h.gain_pct,
                metric_label: "Total Return".to_string(),
                severity: if high { Severity::High } else { Severity::Medium },
            });
            deductions += if high { 2 } else { 1 };
        }

        if h.gain_pct < config.review_loss_pct {
            let high = h.gain_pct < config.review_loss_high_pct;
            items.push(Recommendation {
                kind: RecommendationKind::Review,
                symbol: Some(h.symbol.clone()),
                title: format!("Review your {} position", h.symbol),
                description: format!(
                    "Down {}% from cost. Review thesis or consider averaging down.",
                    pct(h.gain_pct.abs())
                ),
                metric: h.gain_pct,
                metric_label: "Total Return".to_string(),
                severity: if high { Severity::High } else { Severity::Medium },
            });
            deductions += if high { 5 } else { 3 };
        }

        if h.allocation_pct > config.max_position_pct {
            let high = h.allocation_pct > config.max_position_high_pct;
            items.push(Recommendation {
                kind: RecommendationKind::Rebalance,
                symbol: Some(h.symbol.clone()),
                title: format!("{} is overweight", h.symbol),
                description: format!(
                    "At {}% of portfolio. Consider rebalancing for diversification.",
                    pct(h.allocation_pct)
                ),
                metric: h.allocation_pct,
                metric_label: "Portfolio Weight".to_string(),
                severity: if high { Severity::High } else { Severity::Medium },
            });
            deductions += if high { 3 } else { 1 };
        }

        if h.day_change_pct.abs() > config.watch_day_change_pct {
            let direction = if h.day_change_pct.is_sign_positive() { "up" } else { "down" };
            items.push(Recommendation {
                kind: RecommendationKind::Watch,
                symbol: Some(h.symbol.clone()),
                title: format!(
                    "{} moved {direction} {}% today",
                    h.symbol,
                    pct(h.day_change_pct.abs())
                ),
                description: "Check for news or earnings announcements.".to_string(),
                metric: h.day_change_pct,
                metric_label: "Day Change".to_string(),
                severity: Severity::Low,
            });
        }
    }

    let mut by_country: BTreeMap<Country, Decimal> = BTreeMap::new();
    for h in holdings {
        *by_country.entry(h.country).or_default() += h.allocation_pct;
    }
    for (country, weight) in by_country {
        if weight > config.max_country_pct {
            items.push(Recommendation {
                kind: RecommendationKind::Rebalance,
                symbol: None,
                title: format!("High {country} concentration ({}%)", weight.round_dp(0)),
                description: "Consider adding international diversification.".to_string(),
                metric: weight,
                metric_label: "Country Weight".to_string(),
                severity: Severity::Medium,
            });
            deductions += 2;
        }
    }

    // Stable, so equal severities keep holding order.
    items.sort_by_key(|r| r.severity);

    let mut summary = RecommendationCounts::default();
    for item in &items {
        match item.kind {
            RecommendationKind::TakeProfit => summary.take_profit += 1,
            RecommendationKind::Review => summary.review += 1,
            RecommendationKind::Rebalance => summary.rebalance += 1,
            RecommendationKind::Watch => summary.watch += 1,
        }
    }

    let score = health_score(deductions);
    RecommendationReport {
        recommendations: items,
        health_score: score,
        health_grade: health_grade(score),
        summary,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Concentration,
    BigLoss,
    Underwater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Alert,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub symbol: String,
    pub message: String,
    pub severity: AlertSeverity,
}

pub fn briefing_alerts(holdings: &[HoldingMetrics], config: &RecommendationConfig) -> Vec<Alert> {
    let mut alerts = Vec::new();
    for h in holdings {
        if h.allocation_pct > config.concentration_alert_pct {
            alerts.push(Alert {
                kind: AlertKind::Concentration,
                symbol: h.symbol.clone(),
                message: format!("{} is {}% of portfolio", h.symbol, pct(h.allocation_pct)),
                severity: AlertSeverity::Warning,
            });
        }
        if h.day_change_pct < config.daily_loss_alert_pct {
            alerts.push(Alert {
                kind: AlertKind::BigLoss,
                symbol: h.symbol.clone(),
                message: format!("{} down {}% today", h.symbol, pct(h.day_change_pct.abs())),
                severity: AlertSeverity::Alert,
            });
        }
        if h.gain_pct < config.underwater_alert_pct {
            alerts.push(Alert {
                kind: AlertKind::Underwater,
                symbol: h.symbol.clone(),
                message: format!("{} down {}% from cost", h.symbol, pct(h.gain_pct.abs())),
                severity: AlertSeverity::Info,
            });
        }
    }
    alerts
}
