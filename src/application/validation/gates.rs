use crate::domain::types::{IndicatorSnapshot, OrderSide};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Why a placement was turned away. `reason_text` feeds the order's
/// `reason` field and therefore the retry classification catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidSymbol,
    DuplicateOrder,
    PortfolioFull,
    AlreadyHeld,
    InsufficientBalance,
    VolumeRatioExceeded,
    IndicatorsUnavailable,
}

impl RejectReason {
    pub fn reason_text(&self) -> &'static str {
        match self {
            RejectReason::InvalidSymbol => "invalid symbol",
            RejectReason::DuplicateOrder => "duplicate active order",
            RejectReason::PortfolioFull => "portfolio capacity reached",
            RejectReason::AlreadyHeld => "already in holdings",
            RejectReason::InsufficientBalance => "insufficient balance",
            RejectReason::VolumeRatioExceeded => "position-to-volume ratio exceeded",
            RejectReason::IndicatorsUnavailable => "indicators unavailable",
        }
    }
}

#[derive(Debug, Clone)]
pub enum GateOutcome {
    Pass,
    /// Balance gate may shrink a retry to what the account can afford.
    Downscale(Decimal),
    Reject { reason: RejectReason, detail: String },
}

/// Everything a gate may look at, pre-fetched by the validation service so
/// that gates themselves stay synchronous-free of broker I/O.
pub struct GateContext<'a> {
    pub side: OrderSide,
    pub symbol: &'a str,
    pub quantity: Decimal,
    pub price: Decimal,
    pub is_retry: bool,
    pub symbol_known: bool,
    pub has_duplicate_pending: bool,
    pub open_positions: usize,
    pub in_flight_buys: usize,
    pub holdings_qty: Decimal,
    pub available_cash: Decimal,
    pub avg_daily_notional: Option<Decimal>,
    pub indicators: Option<&'a IndicatorSnapshot>,
    pub max_portfolio_size: usize,
    pub min_qty: Decimal,
}

/// One pre-trade check. Lower priority runs first; the pipeline stops at
/// the first rejection.
#[async_trait]
pub trait PretradeGate: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> u8;

    async fn check(&self, ctx: &GateContext<'_>) -> GateOutcome;
}

pub struct SymbolKnownGate;

#[async_trait]
impl PretradeGate for SymbolKnownGate {
    fn name(&self) -> &str {
        "SymbolKnown"
    }

    fn priority(&self) -> u8 {
        10
    }

    async fn check(&self, ctx: &GateContext<'_>) -> GateOutcome {
        if ctx.symbol_known {
            GateOutcome::Pass
        } else {
            GateOutcome::Reject {
                reason: RejectReason::InvalidSymbol,
                detail: format!("{} does not resolve to a broker instrument", ctx.symbol),
            }
        }
    }
}

pub struct DuplicateOrderGate;

#[async_trait]
impl PretradeGate for DuplicateOrderGate {
    fn name(&self) -> &str {
        "DuplicateOrder"
    }

    fn priority(&self) -> u8 {
        20
    }

    async fn check(&self, ctx: &GateContext<'_>) -> GateOutcome {
        if ctx.has_duplicate_pending {
            GateOutcome::Reject {
                reason: RejectReason::DuplicateOrder,
                detail: format!("pending {} order already exists for {}", ctx.side, ctx.symbol),
            }
        } else {
            GateOutcome::Pass
        }
    }
}

pub struct PortfolioCapacityGate;

#[async_trait]
impl PretradeGate for PortfolioCapacityGate {
    fn name(&self) -> &str {
        "PortfolioCapacity"
    }

    fn priority(&self) -> u8 {
        30
    }

    async fn check(&self, ctx: &GateContext<'_>) -> GateOutcome {
        if ctx.side != OrderSide::Buy {
            return GateOutcome::Pass;
        }
        let occupied = ctx.open_positions + ctx.in_flight_buys;
        if occupied >= ctx.max_portfolio_size {
            GateOutcome::Reject {
                reason: RejectReason::PortfolioFull,
                detail: format!(
                    "{} positions + {} in-flight >= limit {}",
                    ctx.open_positions, ctx.in_flight_buys, ctx.max_portfolio_size
                ),
            }
        } else {
            GateOutcome::Pass
        }
    }
}

pub struct AlreadyHeldGate;

#[async_trait]
impl PretradeGate for AlreadyHeldGate {
    fn name(&self) -> &str {
        "AlreadyHeld"
    }

    fn priority(&self) -> u8 {
        40
    }

    async fn check(&self, ctx: &GateContext<'_>) -> GateOutcome {
        if ctx.side == OrderSide::Buy && ctx.holdings_qty > Decimal::ZERO {
            GateOutcome::Reject {
                reason: RejectReason::AlreadyHeld,
                detail: format!("{} already held (qty {})", ctx.symbol, ctx.holdings_qty),
            }
        } else {
            GateOutcome::Pass
        }
    }
}

pub struct BalanceGate;

#[async_trait]
impl PretradeGate for BalanceGate {
    fn name(&self) -> &str {
        "Balance"
    }

    fn priority(&self) -> u8 {
        50
    }

    async fn check(&self, ctx: &GateContext<'_>) -> GateOutcome {
        if ctx.side != OrderSide::Buy {
            return GateOutcome::Pass;
        }
        if ctx.price <= Decimal::ZERO {
            return GateOutcome::Reject {
                reason: RejectReason::InsufficientBalance,
                detail: "no valid reference price".to_string(),
            };
        }

        let affordable = (ctx.available_cash / ctx.price).floor();
        if affordable < ctx.min_qty {
            return GateOutcome::Reject {
                reason: RejectReason::InsufficientBalance,
                detail: format!(
                    "cash {} affords {} < min qty {}",
                    ctx.available_cash, affordable, ctx.min_qty
                ),
            };
        }

        if ctx.quantity > affordable {
            if ctx.is_retry {
                // Retry path downscales instead of failing outright
                GateOutcome::Downscale(affordable)
            } else {
                GateOutcome::Reject {
                    reason: RejectReason::InsufficientBalance,
                    detail: format!("qty {} > affordable {}", ctx.quantity, affordable),
                }
            }
        } else {
            GateOutcome::Pass
        }
    }
}

pub struct VolumeRatioGate;

impl VolumeRatioGate {
    /// Tiered thresholds by price band, as a fraction of average daily
    /// notional.
    fn tier_threshold(price: Decimal) -> Decimal {
        if price < Decimal::from(100) {
            Decimal::new(5, 4) // 0.05%
        } else if price <= Decimal::from(1000) {
            Decimal::new(1, 3) // 0.1%
        } else {
            Decimal::new(2, 3) // 0.2%
        }
    }
}

#[async_trait]
impl PretradeGate for VolumeRatioGate {
    fn name(&self) -> &str {
        "VolumeRatio"
    }

    fn priority(&self) -> u8 {
        60
    }

    async fn check(&self, ctx: &GateContext<'_>) -> GateOutcome {
        let Some(avg_notional) = ctx.avg_daily_notional else {
            return GateOutcome::Pass;
        };
        if avg_notional <= Decimal::ZERO {
            return GateOutcome::Pass;
        }

        let order_value = ctx.quantity * ctx.price;
        let ratio = order_value / avg_notional;
        let threshold = Self::tier_threshold(ctx.price);

        if ratio > threshold {
            GateOutcome::Reject {
                reason: RejectReason::VolumeRatioExceeded,
                detail: format!("ratio {} > tier threshold {}", ratio, threshold),
            }
        } else {
            GateOutcome::Pass
        }
    }
}

pub struct IndicatorsPresentGate;

#[async_trait]
impl PretradeGate for IndicatorsPresentGate {
    fn name(&self) -> &str {
        "IndicatorsPresent"
    }

    fn priority(&self) -> u8 {
        70
    }

    async fn check(&self, ctx: &GateContext<'_>) -> GateOutcome {
        match ctx.indicators {
            Some(snapshot) if snapshot.is_complete() => GateOutcome::Pass,
            _ => GateOutcome::Reject {
                reason: RejectReason::IndicatorsUnavailable,
                detail: format!("required indicators missing for {}", ctx.symbol),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ctx<'a>() -> GateContext<'a> {
        GateContext {
            side: OrderSide::Buy,
            symbol: "ACME",
            quantity: dec!(10),
            price: dec!(2500),
            is_retry: false,
            symbol_known: true,
            has_duplicate_pending: false,
            open_positions: 0,
            in_flight_buys: 0,
            holdings_qty: Decimal::ZERO,
            avg_daily_notional: None,
            available_cash: dec!(100000),
            indicators: None,
            max_portfolio_size: 6,
            min_qty: dec!(1),
        }
    }

    #[tokio::test]
    async fn test_balance_gate_rejects_short_cash() {
        let mut c = ctx();
        c.available_cash = dec!(500);
        match BalanceGate.check(&c).await {
            GateOutcome::Reject { reason, .. } => {
                assert_eq!(reason, RejectReason::InsufficientBalance)
            }
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_balance_gate_downscales_on_retry() {
        let mut c = ctx();
        c.is_retry = true;
        c.available_cash = dec!(10000); // affords 4 @ 2500
        match BalanceGate.check(&c).await {
            GateOutcome::Downscale(qty) => assert_eq!(qty, dec!(4)),
            other => panic!("Expected downscale, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_capacity_counts_in_flight_buys() {
        let mut c = ctx();
        c.open_positions = 4;
        c.in_flight_buys = 2;
        match PortfolioCapacityGate.check(&c).await {
            GateOutcome::Reject { reason, .. } => assert_eq!(reason, RejectReason::PortfolioFull),
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_volume_ratio_tiers() {
        assert_eq!(VolumeRatioGate::tier_threshold(dec!(50)), dec!(0.0005));
        assert_eq!(VolumeRatioGate::tier_threshold(dec!(500)), dec!(0.001));
        assert_eq!(VolumeRatioGate::tier_threshold(dec!(5000)), dec!(0.002));

        let mut c = ctx();
        // 10 x 2500 = 25,000 order value against 1,000,000 avg notional
        // = 2.5% which is far above the 0.2% tier
        c.avg_daily_notional = Some(dec!(1000000));
        match VolumeRatioGate.check(&c).await {
            GateOutcome::Reject { reason, .. } => {
                assert_eq!(reason, RejectReason::VolumeRatioExceeded)
            }
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sell_side_skips_buy_gates() {
        let mut c = ctx();
        c.side = OrderSide::Sell;
        c.holdings_qty = dec!(10);
        c.open_positions = 6;
        assert!(matches!(AlreadyHeldGate.check(&c).await, GateOutcome::Pass));
        assert!(matches!(
            PortfolioCapacityGate.check(&c).await,
            GateOutcome::Pass
        ));
    }
}
