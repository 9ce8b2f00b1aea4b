//! Per-second billing rates and billed-amount calculation.
//!
//! Serverless endpoints bill in one of two modes. An endpoint that keeps at
//! least one worker warm is billed as [`BillingMode::Active`] at a lower rate
//! on exact wall-clock seconds. A scale-to-zero endpoint is billed as
//! [`BillingMode::Flex`] at a higher rate, rounded up to whole seconds.

use std::time::Duration;

/// Rate applied when the endpoint advertises no compute class at all.
pub const UNKNOWN_CLASS_RATE: f64 = 0.000_19;

/// Per-second rate for the hosted prediction model, billed like a flex
/// endpoint on the prediction time the service reports.
pub const PREDICTION_RATE: f64 = 0.000_225;

/// How a remote endpoint is billed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BillingMode {
    /// At least one worker is always running.
    Active,
    /// Workers scale to zero between jobs.
    Flex,
}

impl BillingMode {
    /// Derives the billing mode from an endpoint's minimum worker count.
    #[must_use]
    pub const fn from_workers_min(workers_min: u32) -> Self {
        if workers_min > 0 {
            Self::Active
        } else {
            Self::Flex
        }
    }

    /// Returns `true` for [`BillingMode::Active`].
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Selects the duration the provider bills for.
    ///
    /// Active endpoints are paid for regardless of idle gaps, so the client
    /// measured wall time is used. Flex endpoints use the execution time the
    /// job reported; queue and cold-start delay are not attributed.
    #[must_use]
    pub const fn billable_duration(self, wall: Duration, execution: Duration) -> Duration {
        match self {
            Self::Active => wall,
            Self::Flex => execution,
        }
    }
}

/// Active and flex per-second rates for one compute class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassRates {
    /// Dollars per second with a warm worker.
    pub active: f64,
    /// Dollars per second when scaling to zero.
    pub flex: f64,
}

impl ClassRates {
    const fn new(active: f64, flex: f64) -> Self {
        Self { active, flex }
    }

    /// Picks the rate for a billing mode.
    #[must_use]
    pub const fn for_mode(self, mode: BillingMode) -> f64 {
        match mode {
            BillingMode::Active => self.active,
            BillingMode::Flex => self.flex,
        }
    }
}

const DEFAULT_RATES: ClassRates = ClassRates::new(0.000_13, 0.000_19);

const RATE_TABLE: &[(&[&str], ClassRates)] = &[
    (&["NVIDIA B200"], ClassRates::new(0.001_90, 0.002_40)),
    (
        &["NVIDIA H200", "NVIDIA H200 NVL"],
        ClassRates::new(0.001_24, 0.001_55),
    ),
    (
        &["NVIDIA H100 80GB HBM3", "NVIDIA H100 PCIe", "NVIDIA H100 NVL"],
        ClassRates::new(0.000_93, 0.001_16),
    ),
    (
        &["NVIDIA A100-SXM4-80GB", "NVIDIA A100 80GB PCIe"],
        ClassRates::new(0.000_60, 0.000_76),
    ),
    (
        &[
            "NVIDIA L40",
            "NVIDIA L40S",
            "NVIDIA RTX 6000 Ada Generation",
        ],
        ClassRates::new(0.000_37, 0.000_53),
    ),
    (
        &["NVIDIA RTX A6000", "NVIDIA A40", "NVIDIA GeForce RTX 5090"],
        ClassRates::new(0.000_31, 0.000_44),
    ),
    (
        &["NVIDIA GeForce RTX 4090"],
        ClassRates::new(0.000_21, 0.000_31),
    ),
    (
        &[
            "NVIDIA L4",
            "NVIDIA RTX A5000",
            "NVIDIA A5000 Ada",
            "NVIDIA GeForce RTX 3090",
            "NVIDIA GeForce RTX 3090 Ti",
        ],
        ClassRates::new(0.000_13, 0.000_19),
    ),
    (
        &[
            "NVIDIA RTX A4000",
            "NVIDIA RTX A4500",
            "NVIDIA RTX 4000 Ada Generation",
            "NVIDIA RTX 4000 SFF Ada Generation",
            "NVIDIA RTX 2000 Ada Generation",
            "NVIDIA RTX A2000",
        ],
        ClassRates::new(0.000_11, 0.000_16),
    ),
];

fn normalise_class(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Looks up the rate pair for a compute class, falling back to the default
/// tier for classes missing from the table.
#[must_use]
pub fn class_rates(compute_class: &str) -> ClassRates {
    let wanted = normalise_class(compute_class);
    RATE_TABLE
        .iter()
        .find(|(names, _)| names.iter().any(|name| name.eq_ignore_ascii_case(&wanted)))
        .map_or(DEFAULT_RATES, |(_, rates)| *rates)
}

/// Every compute class in the rate table, most expensive tier first.
pub fn known_classes() -> impl Iterator<Item = (&'static str, ClassRates)> {
    RATE_TABLE
        .iter()
        .flat_map(|(names, rates)| names.iter().map(move |name| (*name, *rates)))
}

/// Returns the per-second rate for an endpoint.
///
/// Only the first compute class is considered, since that is the class the
/// provider tries first when allocating a worker.
#[must_use]
pub fn rate(compute_classes: &[String], workers_min: u32) -> f64 {
    compute_classes.first().map_or(UNKNOWN_CLASS_RATE, |class| {
        class_rates(class).for_mode(BillingMode::from_workers_min(workers_min))
    })
}

/// Computes the amount billed for `duration` at `rate`.
///
/// Flex billing rounds up to the next whole second; active billing charges
/// the exact duration. A zero (or negative) rate always bills zero.
#[must_use]
#[expect(
    clippy::float_arithmetic,
    reason = "billing is expressed in fractional dollars"
)]
pub fn billed_cost(duration: Duration, rate: f64, mode: BillingMode) -> f64 {
    if rate <= 0.0 {
        return 0.0;
    }
    match mode {
        BillingMode::Active => duration.as_secs_f64() * rate,
        BillingMode::Flex => whole_seconds_rounded_up(duration) * rate,
    }
}

fn whole_seconds_rounded_up(duration: Duration) -> f64 {
    let mut seconds = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        seconds = seconds.saturating_add(1);
    }
    f64::from(u32::try_from(seconds).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn approx_eq(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-12
    }

    #[test]
    fn flex_billing_rounds_up_to_whole_seconds() {
        let cost = billed_cost(Duration::from_millis(1200), 0.0002, BillingMode::Flex);
        assert!(approx_eq(cost, 2.0 * 0.0002), "unexpected flex cost {cost}");
    }

    #[test]
    fn active_billing_charges_exact_duration() {
        let cost = billed_cost(Duration::from_millis(1200), 0.0002, BillingMode::Active);
        assert!(approx_eq(cost, 1.2 * 0.0002), "unexpected active cost {cost}");
    }

    #[test]
    fn flex_billing_keeps_exact_whole_seconds() {
        let cost = billed_cost(Duration::from_secs(3), 0.0001, BillingMode::Flex);
        assert!(approx_eq(cost, 3.0 * 0.0001), "unexpected flex cost {cost}");
    }

    #[test]
    fn known_classes_cover_the_default_gpu() {
        let (_, rates) = known_classes()
            .find(|(name, _)| *name == "NVIDIA RTX A4000")
            .unwrap_or_else(|| panic!("default class listed"));
        assert_eq!(rates, class_rates("NVIDIA RTX A4000"));
    }

    #[test]
    fn zero_rate_bills_nothing() {
        let cost = billed_cost(Duration::from_secs(30), 0.0, BillingMode::Flex);
        assert!(approx_eq(cost, 0.0));
    }

    #[rstest]
    #[case("NVIDIA RTX A4000", 0, 0.000_16)]
    #[case("NVIDIA RTX A4000", 1, 0.000_11)]
    #[case("NVIDIA  RTX   A4500", 0, 0.000_16)]
    #[case("NVIDIA B200", 2, 0.001_90)]
    #[case("nvidia geforce rtx 4090", 0, 0.000_31)]
    #[case("Some Future GPU", 0, 0.000_19)]
    #[case("Some Future GPU", 1, 0.000_13)]
    fn rate_resolves_first_class(
        #[case] class: &str,
        #[case] workers_min: u32,
        #[case] expected: f64,
    ) {
        let resolved = rate(&[class.to_owned()], workers_min);
        assert!(approx_eq(resolved, expected), "{class}: got {resolved}");
    }

    #[test]
    fn rate_without_classes_uses_fallback() {
        assert!(approx_eq(rate(&[], 1), UNKNOWN_CLASS_RATE));
    }

    #[test]
    fn billable_duration_follows_mode() {
        let wall = Duration::from_secs(9);
        let execution = Duration::from_secs(4);
        assert_eq!(BillingMode::Active.billable_duration(wall, execution), wall);
        assert_eq!(BillingMode::Flex.billable_duration(wall, execution), execution);
    }
}
