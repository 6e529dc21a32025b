use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::booking::{ServiceType, TankSize};

/// Flat call-out fee charged on every job, KES.
const BASE_PRICE: u32 = 500;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Quote {
    pub base_price: Decimal,
    pub tank_charge: Decimal,
    pub distance_charge: Decimal,
    pub total: Decimal,
}

/// Quote for a service before any booking exists. Deterministic: the same
/// (service_type, tank_size) pair always prices the same. Distance surcharge
/// is carried in the breakdown but currently always zero.
pub fn quote(_service_type: ServiceType, tank_size: TankSize) -> Quote {
    let base_price = Decimal::from(BASE_PRICE);
    let tank_charge = Decimal::from(tank_charge_kes(tank_size));
    let distance_charge = Decimal::ZERO;

    Quote {
        base_price,
        tank_charge,
        distance_charge,
        total: base_price + tank_charge + distance_charge,
    }
}

// Canonical tier table, keyed by tank size rather than raw strings so a
// missing tier cannot silently price at zero.
fn tank_charge_kes(tank_size: TankSize) -> u32 {
    match tank_size {
        TankSize::L1000 => 1000,
        TankSize::L2000 => 2000,
        TankSize::L3000 => 3000,
        TankSize::L5000 => 5000,
        TankSize::L10000 => 10000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tier_prices_above_base() {
        for size in [
            TankSize::L1000,
            TankSize::L2000,
            TankSize::L3000,
            TankSize::L5000,
            TankSize::L10000,
        ] {
            let q = quote(ServiceType::Septic, size);
            assert!(q.tank_charge > Decimal::ZERO);
            assert_eq!(q.total, q.base_price + q.tank_charge + q.distance_charge);
        }
    }

    #[test]
    fn smallest_tank_quotes_base_plus_tier() {
        let q = quote(ServiceType::PitLatrine, TankSize::L1000);
        assert_eq!(q.base_price, Decimal::from(500));
        assert_eq!(q.tank_charge, Decimal::from(1000));
        assert_eq!(q.distance_charge, Decimal::ZERO);
        assert_eq!(q.total, Decimal::from(1500));
    }

    #[test]
    fn quote_is_deterministic() {
        let a = quote(ServiceType::Septic, TankSize::L5000);
        let b = quote(ServiceType::Septic, TankSize::L5000);
        assert_eq!(a, b);
    }
}
