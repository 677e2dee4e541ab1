mod support;

use anyhow::Result;
use holdbook::models::Country;
use holdbook::portfolio::{AlertKind, NewHolding, PriceMode, RecommendationKind};
use support::{date, dec, Harness, MockPrices, MockRates};

// XEQT: 100 @ 30.05 CAD in a TFSA, trading at 35 (prev 34).
// AAPL: 10 @ 150 USD unassigned, trading at 200 (prev 210), USD:CAD 1.37.
async fn two_country_portfolio() -> Result<Harness> {
    let prices = MockPrices::new()
        .with_quote("XEQT", "35", Some("34"))
        .with_quote("AAPL", "200", Some("210"));
    let h = Harness::new(date(2024, 6, 3), prices, MockRates::new());
    let ledger = h.ledger();
    ledger
        .create_holding(
            NewHolding::new("XEQT", "TSX", Country::Canada, "CAD")
                .with_account("TFSA")
                .with_position(dec("100"), dec("30.05"), date(2024, 1, 2)),
        )
        .await?;
    ledger
        .create_holding(
            NewHolding::new("AAPL", "NASDAQ", Country::UnitedStates, "USD")
                .with_position(dec("10"), dec("150"), date(2024, 1, 2)),
        )
        .await?;
    Ok(h)
}

#[tokio::test]
async fn live_summary_converts_to_base_currency() -> Result<()> {
    let h = two_country_portfolio().await?;
    let summary = h.analytics().summary(PriceMode::Live).await?;

    assert_eq!(summary.currency, "CAD");
    assert_eq!(summary.total_value, dec("6240"));
    assert_eq!(summary.total_cost, dec("5060"));
    assert_eq!(summary.unrealized_gain, dec("1180"));
    // Previous closes value the book at 3400 + 2877.
    assert_eq!(summary.today_change, dec("-37"));
    assert_eq!(summary.holdings_count, 2);
    assert_eq!(summary.countries.get(&Country::Canada), Some(&1));
    assert!(summary.warnings.is_empty());
    Ok(())
}

#[tokio::test]
async fn fast_mode_reads_prices_persisted_by_a_live_pass() -> Result<()> {
    let h = two_country_portfolio().await?;
    let analytics = h.analytics();

    let before = analytics.summary(PriceMode::Fast).await?;
    assert_eq!(before.total_value, dec("0"));
    assert_eq!(before.warnings.len(), 2);

    analytics.summary(PriceMode::Live).await?;
    let after = analytics.summary(PriceMode::Fast).await?;
    assert_eq!(after.total_value, dec("6240"));
    assert_eq!(after.today_change, dec("0"));
    Ok(())
}

#[tokio::test]
async fn movers_split_gainers_and_losers() -> Result<()> {
    let h = two_country_portfolio().await?;
    let movers = h.analytics().daily_movers(5).await?;

    assert_eq!(movers.all_holdings.len(), 2);
    assert_eq!(movers.top_gainers.len(), 1);
    assert_eq!(movers.top_gainers[0].symbol, "XEQT");
    assert_eq!(movers.top_gainers[0].day_change_value, dec("100"));
    assert_eq!(movers.top_losers.len(), 1);
    assert_eq!(movers.top_losers[0].symbol, "AAPL");
    assert_eq!(movers.top_losers[0].day_change_value, dec("-137"));
    Ok(())
}

#[tokio::test]
async fn accounts_separate_tax_advantaged_value() -> Result<()> {
    let h = two_country_portfolio().await?;
    let breakdown = h.analytics().account_breakdown(PriceMode::Live).await?;

    assert_eq!(breakdown.tax_advantaged_total, dec("3500"));
    assert_eq!(breakdown.taxable_total, dec("2740"));
    let tfsa = &breakdown.by_account["TFSA"];
    assert!(tfsa.is_tax_advantaged);
    assert_eq!(tfsa.name, "Tax-Free Savings Account");
    assert_eq!(tfsa.gain, dec("495"));
    let unassigned = &breakdown.by_account["UNASSIGNED"];
    assert!(!unassigned.is_tax_advantaged);
    assert_eq!(unassigned.holdings_count, 1);
    Ok(())
}

#[tokio::test]
async fn allocation_and_recommendations_flag_overweight_positions() -> Result<()> {
    let h = two_country_portfolio().await?;
    let analytics = h.analytics();

    let allocation = analytics.allocation(PriceMode::Live).await?;
    assert_eq!(allocation.top_holdings[0].symbol, "XEQT");
    let total: rust_decimal::Decimal = allocation.by_country.values().sum();
    assert_eq!(total.round_dp(6), dec("100"));

    let report = analytics.recommendations(PriceMode::Live).await?;
    let rebalance: Vec<_> = report
        .recommendations
        .iter()
        .filter(|r| r.kind == RecommendationKind::Rebalance)
        .filter_map(|r| r.symbol.as_deref())
        .collect();
    assert_eq!(rebalance.len(), 2);
    assert!(report.health_score < 100);

    let briefing = analytics.briefing().await?;
    assert_eq!(briefing.summary.total_value, dec("6240"));
    assert!(briefing
        .alerts
        .iter()
        .all(|a| a.kind == AlertKind::Concentration));
    assert_eq!(briefing.alerts.len(), 2);
    Ok(())
}

#[tokio::test]
async fn empty_portfolio_is_healthy() -> Result<()> {
    let h = Harness::new(date(2024, 6, 3), MockPrices::new(), MockRates::new());
    let report = h.analytics().recommendations(PriceMode::Live).await?;
    assert!(report.recommendations.is_empty());
    assert_eq!(report.health_score, 100);
    assert_eq!(report.health_grade, "A");
    Ok(())
}
