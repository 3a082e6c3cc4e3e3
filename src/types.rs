//! Core data types used across the trading core.
//!
//! All string-valued states persisted to the store or parsed from LLM output
//! are closed enumerations; anything outside the set is rejected at the
//! boundary with a [`ParseEnumError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a persisted or external string is not a member of a
/// closed enumeration.
#[derive(Debug, Error)]
#[error("invalid {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

str_enum! {
    /// Exchange-side position direction, lowercase per the venue payloads.
    PositionSide {
        Long => "long",
        Short => "short",
    }
}

impl PositionSide {
    pub fn direction(&self) -> Direction {
        match self {
            PositionSide::Long => Direction::Long,
            PositionSide::Short => Direction::Short,
        }
    }

    /// Signed multiplier for PnL arithmetic: +1 long, -1 short.
    pub fn dir_sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

str_enum! {
    /// Order/queue direction, uppercase in the store.
    Direction {
        Long => "LONG",
        Short => "SHORT",
    }
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn position_side(&self) -> PositionSide {
        match self {
            Direction::Long => PositionSide::Long,
            Direction::Short => PositionSide::Short,
        }
    }

    pub fn dir_sign(&self) -> f64 {
        self.position_side().dir_sign()
    }
}

str_enum! {
    /// Action requested through the execution queue.
    ActionType {
        Open => "OPEN",
        Add => "ADD",
        Reduce => "REDUCE",
        Close => "CLOSE",
        FullClose => "FULL_CLOSE",
        ReverseClose => "REVERSE_CLOSE",
        ReverseOpen => "REVERSE_OPEN",
    }
}

impl ActionType {
    /// Risk-reducing actions stay allowed under protection mode.
    pub fn is_risk_reducing(&self) -> bool {
        matches!(
            self,
            ActionType::Reduce
                | ActionType::Close
                | ActionType::FullClose
                | ActionType::ReverseClose
        )
    }
}

str_enum! {
    /// Order type recorded on execution_log rows. A superset of
    /// [`ActionType`]: exits carry their cause so the fill watcher can route
    /// to the right handler and reports can name the close reason.
    OrderType {
        Open => "OPEN",
        Add => "ADD",
        Reduce => "REDUCE",
        Close => "CLOSE",
        FullClose => "FULL_CLOSE",
        EmergencyClose => "EMERGENCY_CLOSE",
        ScheduledClose => "SCHEDULED_CLOSE",
        StopLoss => "STOP_LOSS",
        ReverseClose => "REVERSE_CLOSE",
        ReverseOpen => "REVERSE_OPEN",
    }
}

impl OrderType {
    /// Exit-class orders are verified against a flat position and settle the
    /// whole remaining entry fee.
    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            OrderType::Close
                | OrderType::FullClose
                | OrderType::EmergencyClose
                | OrderType::ScheduledClose
                | OrderType::StopLoss
        )
    }

    /// Orders counted as realized trades by the adaptive layers.
    pub fn is_realizing(&self) -> bool {
        self.is_exit() || matches!(self, OrderType::Reduce | OrderType::ReverseClose)
    }
}

impl From<ActionType> for OrderType {
    fn from(a: ActionType) -> Self {
        match a {
            ActionType::Open => OrderType::Open,
            ActionType::Add => OrderType::Add,
            ActionType::Reduce => OrderType::Reduce,
            ActionType::Close => OrderType::Close,
            ActionType::FullClose => OrderType::FullClose,
            ActionType::ReverseClose => OrderType::ReverseClose,
            ActionType::ReverseOpen => OrderType::ReverseOpen,
        }
    }
}

str_enum! {
    /// Lifecycle of an execution_queue row.
    QueueStatus {
        Pending => "PENDING",
        Picked => "PICKED",
        Filled => "FILLED",
        Canceled => "CANCELED",
        Timeout => "TIMEOUT",
    }
}

str_enum! {
    /// Lifecycle of an execution_log row (owned by the fill watcher).
    ExecStatus {
        Sent => "SENT",
        PartiallyFilled => "PARTIALLY_FILLED",
        Filled => "FILLED",
        Canceled => "CANCELED",
        Timeout => "TIMEOUT",
        Verified => "VERIFIED",
    }
}

str_enum! {
    /// In-flight order status mirrored on position_state.
    OrderState {
        None => "NONE",
        Sent => "SENT",
        Partial => "PARTIAL",
        Filled => "FILLED",
        Canceled => "CANCELED",
        Timeout => "TIMEOUT",
    }
}

str_enum! {
    /// Higher-level position intent state.
    PlanState {
        None => "PLAN.NONE",
        Open => "PLAN.OPEN",
        Entering => "PLAN.ENTERING",
        Exiting => "PLAN.EXITING",
    }
}

impl PlanState {
    /// Intent states are transient; the reconciler waits on them instead of
    /// healing while an order may still be in flight.
    pub fn is_intent(&self) -> bool {
        matches!(self, PlanState::Entering | PlanState::Exiting)
    }
}

str_enum! {
    /// Decision-path classification from the event trigger engine.
    EventMode {
        Default => "DEFAULT",
        Event => "EVENT",
        EventDecision => "EVENT_DECISION",
        Emergency => "EMERGENCY",
    }
}

str_enum! {
    /// Who/what initiated an analysis call.
    CallType {
        Auto => "AUTO",
        AutoMini => "AUTO_MINI",
        AutoEmergency => "AUTO_EMERGENCY",
        User => "USER",
        Emergency => "EMERGENCY",
    }
}

str_enum! {
    /// Output of the deterministic decision engine.
    PmAction {
        Hold => "HOLD",
        Add => "ADD",
        Reduce => "REDUCE",
        Close => "CLOSE",
        Reverse => "REVERSE",
    }
}

str_enum! {
    /// Guarded action set of the event-decision engine.
    EventDecisionAction {
        Hold => "HOLD",
        RiskOffReduce => "RISK_OFF_REDUCE",
        HardExit => "HARD_EXIT",
        FreezeNewEntry => "FREEZE_NEW_ENTRY",
        Reverse => "REVERSE",
        Hedge => "HEDGE",
    }
}

str_enum! {
    /// Entry strategy family, used by the adaptive layers.
    EntryMode {
        MeanRev => "MeanRev",
        DriftFollow => "DriftFollow",
        BreakoutTrend => "BreakoutTrend",
    }
}

str_enum! {
    /// Lifecycle of a backfill job run.
    JobStatus {
        Running => "RUNNING",
        Partial => "PARTIAL",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
}

/// Live exchange position as reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
    pub liquidation_price: f64,
}

/// OHLCV candlestick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_valid(&self) -> bool {
        self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.high >= self.low
            && self.volume >= 0.0
    }
}

// ============================================================================
// Money Type - Precise Decimal Arithmetic for Monetary Values
// ============================================================================

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Money wraps `rust_decimal::Decimal` so prices, quantities, fees and PnL
/// never cross the persistence boundary as binary floats. Indicator math
/// converts through [`Money::to_f64`].
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn from_f64(value: f64) -> Self {
        Money(Decimal::try_from(value).unwrap_or_else(|_| {
            if value.is_nan() || value.is_infinite() {
                Decimal::ZERO
            } else {
                Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
            }
        }))
    }

    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn max(self, other: Self) -> Self {
        Money(self.0.max(other.0))
    }

    pub fn min(self, other: Self) -> Self {
        Money(self.0.min(other.0))
    }

    /// Round to `dp` decimal places (reporting uses 4).
    pub fn round_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp(dp))
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Money(Decimal::from_str_exact(s)?))
    }
}

impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

impl Div for Money {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        if rhs.0.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl ToSql for Money {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.to_string()))
    }
}

impl FromSql for Money {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Text(t) => {
                let s = std::str::from_utf8(t).map_err(|e| FromSqlError::Other(Box::new(e)))?;
                s.parse::<Money>()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
            ValueRef::Integer(i) => Ok(Money(Decimal::from(i))),
            ValueRef::Null => Ok(Money::ZERO),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_money_precision() {
        let a = Money::from_f64(0.1);
        let b = Money::from_f64(0.2);
        let c = Money::from_f64(0.3);
        assert_eq!(a + b, c, "Money should handle 0.1 + 0.2 = 0.3 correctly");
    }

    #[test]
    fn test_money_roundtrip_text() {
        let m = Money::from_f64(95123.4567);
        let parsed: Money = m.to_string().parse().unwrap();
        assert_eq!(m, parsed);
    }

    #[test]
    fn test_enum_roundtrip() {
        for a in [
            ActionType::Open,
            ActionType::Add,
            ActionType::Reduce,
            ActionType::Close,
            ActionType::FullClose,
            ActionType::ReverseClose,
            ActionType::ReverseOpen,
        ] {
            assert_eq!(ActionType::from_str(a.as_str()).unwrap(), a);
        }
        assert_eq!(PlanState::from_str("PLAN.OPEN").unwrap(), PlanState::Open);
        assert!(PlanState::from_str("OPEN").is_err());
        assert!(ActionType::from_str("YOLO").is_err());
    }

    #[test]
    fn test_risk_reducing_partition() {
        assert!(ActionType::Close.is_risk_reducing());
        assert!(ActionType::FullClose.is_risk_reducing());
        assert!(ActionType::Reduce.is_risk_reducing());
        assert!(ActionType::ReverseClose.is_risk_reducing());
        assert!(!ActionType::Open.is_risk_reducing());
        assert!(!ActionType::Add.is_risk_reducing());
        assert!(!ActionType::ReverseOpen.is_risk_reducing());
    }

    #[test]
    fn test_direction_opposite() {
        assert_eq!(Direction::Long.opposite(), Direction::Short);
        assert_eq!(Direction::Short.opposite(), Direction::Long);
        assert_eq!(PositionSide::Short.dir_sign(), -1.0);
    }
}
