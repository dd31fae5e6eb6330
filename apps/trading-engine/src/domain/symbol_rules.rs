//! Per-symbol trading rules and signal validation.
//!
//! Rules come from `trading_pair` configuration entries and gate every
//! submission before it reaches risk checks or the venue.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::order::{OrderType, TimeInForce};
use super::signal::OrderSignal;

/// Trading rules for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRules {
    /// Trading pair symbol.
    pub symbol: String,
    /// Minimum order quantity.
    pub min_qty: Decimal,
    /// Maximum order quantity.
    pub max_qty: Decimal,
    /// Quantity must be a multiple of this step.
    pub step_size: Decimal,
    /// Limit prices must be a multiple of this tick.
    pub tick_size: Decimal,
    /// Minimum notional (`price * quantity`) for limit orders.
    pub min_notional: Decimal,
    /// Whether the pair is currently tradable.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

const fn default_true() -> bool {
    true
}

/// Validation failures for an order signal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleViolation {
    /// Symbol is not enabled for trading.
    #[error("symbol {0} is not tradable")]
    SymbolDisabled(String),

    /// Quantity must be strictly positive.
    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(Decimal),

    /// Quantity outside `[min_qty, max_qty]`.
    #[error("quantity {quantity} outside [{min}, {max}]")]
    QuantityOutOfRange {
        /// Requested quantity.
        quantity: Decimal,
        /// Minimum allowed.
        min: Decimal,
        /// Maximum allowed.
        max: Decimal,
    },

    /// Quantity not on the step-size grid.
    #[error("quantity {quantity} is not a multiple of step size {step}")]
    QuantityOffStep {
        /// Requested quantity.
        quantity: Decimal,
        /// Step size.
        step: Decimal,
    },

    /// Limit price required but missing.
    #[error("order type {0:?} requires a price")]
    MissingPrice(OrderType),

    /// Stop price required but missing.
    #[error("order type {0:?} requires a stop price")]
    MissingStopPrice(OrderType),

    /// Price not on the tick-size grid.
    #[error("price {price} is not a multiple of tick size {tick}")]
    PriceOffTick {
        /// Requested price.
        price: Decimal,
        /// Tick size.
        tick: Decimal,
    },

    /// Notional below the minimum.
    #[error("notional {notional} below minimum {min}")]
    NotionalTooSmall {
        /// Requested notional.
        notional: Decimal,
        /// Minimum notional.
        min: Decimal,
    },

    /// Time in force incompatible with the order type.
    #[error("time in force {tif:?} is incompatible with order type {order_type:?}")]
    IncompatibleTimeInForce {
        /// Requested time in force.
        tif: TimeInForce,
        /// Order type.
        order_type: OrderType,
    },
}

impl SymbolRules {
    /// Validate a signal against these rules.
    ///
    /// Checks run in a fixed order and the first violation wins, so error
    /// messages are stable for a given input.
    pub fn validate(&self, signal: &OrderSignal) -> Result<(), RuleViolation> {
        if !self.enabled {
            return Err(RuleViolation::SymbolDisabled(self.symbol.clone()));
        }

        if signal.quantity <= Decimal::ZERO {
            return Err(RuleViolation::NonPositiveQuantity(signal.quantity));
        }
        if signal.quantity < self.min_qty || signal.quantity > self.max_qty {
            return Err(RuleViolation::QuantityOutOfRange {
                quantity: signal.quantity,
                min: self.min_qty,
                max: self.max_qty,
            });
        }
        if !is_multiple_of(signal.quantity, self.step_size) {
            return Err(RuleViolation::QuantityOffStep {
                quantity: signal.quantity,
                step: self.step_size,
            });
        }

        if signal.order_type.requires_price() {
            let Some(price) = signal.price else {
                return Err(RuleViolation::MissingPrice(signal.order_type));
            };
            if !is_multiple_of(price, self.tick_size) {
                return Err(RuleViolation::PriceOffTick {
                    price,
                    tick: self.tick_size,
                });
            }
            let notional = price * signal.quantity;
            if notional < self.min_notional {
                return Err(RuleViolation::NotionalTooSmall {
                    notional,
                    min: self.min_notional,
                });
            }
        }
        if signal.order_type.requires_stop_price() && signal.stop_price.is_none() {
            return Err(RuleViolation::MissingStopPrice(signal.order_type));
        }

        Self::validate_time_in_force(signal.order_type, signal.time_in_force)?;
        Ok(())
    }

    /// POST_ONLY orders must rest (GTX or GTC); MARKET orders cannot rest.
    fn validate_time_in_force(
        order_type: OrderType,
        tif: TimeInForce,
    ) -> Result<(), RuleViolation> {
        let compatible = match order_type {
            OrderType::PostOnly => matches!(tif, TimeInForce::Gtx | TimeInForce::Gtc),
            OrderType::Market | OrderType::StopMarket => {
                !matches!(tif, TimeInForce::Gtc | TimeInForce::Gtx)
            }
            OrderType::Limit | OrderType::StopLimit => true,
        };
        if compatible {
            Ok(())
        } else {
            Err(RuleViolation::IncompatibleTimeInForce { tif, order_type })
        }
    }
}

/// Exact multiple check on the decimal grid. Zero steps disable the check.
fn is_multiple_of(value: Decimal, step: Decimal) -> bool {
    if step.is_zero() {
        return true;
    }
    (value % step).is_zero()
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use test_case::test_case;

    use super::*;
    use crate::domain::order::OrderSide;

    fn rules() -> SymbolRules {
        SymbolRules {
            symbol: "BTCUSDT".to_string(),
            min_qty: dec!(0.001),
            max_qty: dec!(10),
            step_size: dec!(0.001),
            tick_size: dec!(0.01),
            min_notional: dec!(10),
            enabled: true,
        }
    }

    fn signal(qty: Decimal, price: Option<Decimal>) -> OrderSignal {
        OrderSignal {
            strategy_id: "alpha".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: qty,
            price,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            post_only: false,
            client_order_id: None,
        }
    }

    #[test_case(dec!(0.0009), false ; "just below minimum")]
    #[test_case(dec!(0.001), true ; "exactly minimum")]
    #[test_case(dec!(0.002), true ; "just above minimum")]
    fn min_qty_boundary(qty: Decimal, ok: bool) {
        let result = rules().validate(&signal(qty, Some(dec!(45000))));
        assert_eq!(result.is_ok(), ok, "{result:?}");
    }

    #[test]
    fn quantity_above_max_rejected() {
        let err = rules()
            .validate(&signal(dec!(11), Some(dec!(45000))))
            .unwrap_err();
        assert!(matches!(err, RuleViolation::QuantityOutOfRange { .. }));
    }

    #[test]
    fn quantity_off_step_rejected() {
        let err = rules()
            .validate(&signal(dec!(0.0015), Some(dec!(45000))))
            .unwrap_err();
        assert!(matches!(err, RuleViolation::QuantityOffStep { .. }));
    }

    #[test_case(dec!(45000.00), true ; "on tick grid")]
    #[test_case(dec!(45000.005), false ; "off tick grid")]
    fn tick_size_boundary(price: Decimal, ok: bool) {
        let result = rules().validate(&signal(dec!(0.001), Some(price)));
        assert_eq!(result.is_ok(), ok, "{result:?}");
    }

    #[test]
    fn notional_below_minimum_rejected() {
        // 0.001 * 5000 = 5 < 10 minimum.
        let err = rules()
            .validate(&signal(dec!(0.001), Some(dec!(5000))))
            .unwrap_err();
        assert!(matches!(err, RuleViolation::NotionalTooSmall { .. }));
    }

    #[test]
    fn limit_requires_price() {
        let err = rules().validate(&signal(dec!(0.001), None)).unwrap_err();
        assert!(matches!(err, RuleViolation::MissingPrice(_)));
    }

    #[test]
    fn market_order_cannot_be_gtc() {
        let mut s = signal(dec!(0.001), None);
        s.order_type = OrderType::Market;
        s.time_in_force = TimeInForce::Gtc;
        let err = rules().validate(&s).unwrap_err();
        assert!(matches!(err, RuleViolation::IncompatibleTimeInForce { .. }));

        s.time_in_force = TimeInForce::Ioc;
        assert!(rules().validate(&s).is_ok());
    }

    #[test]
    fn post_only_requires_resting_tif() {
        let mut s = signal(dec!(0.001), Some(dec!(45000)));
        s.order_type = OrderType::PostOnly;

        s.time_in_force = TimeInForce::Gtx;
        assert!(rules().validate(&s).is_ok());
        s.time_in_force = TimeInForce::Gtc;
        assert!(rules().validate(&s).is_ok());
        s.time_in_force = TimeInForce::Ioc;
        assert!(rules().validate(&s).is_err());
    }

    #[test]
    fn stop_limit_requires_stop_price() {
        let mut s = signal(dec!(0.001), Some(dec!(45000)));
        s.order_type = OrderType::StopLimit;
        let err = rules().validate(&s).unwrap_err();
        assert!(matches!(err, RuleViolation::MissingStopPrice(_)));

        s.stop_price = Some(dec!(44000));
        assert!(rules().validate(&s).is_ok());
    }

    #[test]
    fn disabled_symbol_rejected() {
        let mut r = rules();
        r.enabled = false;
        let err = r
            .validate(&signal(dec!(0.001), Some(dec!(45000))))
            .unwrap_err();
        assert!(matches!(err, RuleViolation::SymbolDisabled(_)));
    }
}
