//! Pricing rule evaluation and quote assembly.
//!
//! Every active rule that matches contributes a delta computed against the
//! un-adjusted base. Deltas are summed; rules never compound and none wins over
//! another. Accommodation and each add-on are floored at zero separately.

use std::collections::HashSet;

use chrono::Datelike;
use rust_decimal::prelude::*;
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

const DECIMAL_PLACES: u32 = 2;

pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

/// What a rule is being evaluated for.
#[derive(Debug, Clone, Copy)]
pub enum PricingTarget {
    /// The stay itself: windows overlap the stay, day sets match any night.
    Stay,
    /// One add-on: windows and day sets are tested against the check-in date only.
    AddOn(Ulid),
}

#[derive(Debug, Clone)]
pub struct RuleMatch<'a> {
    pub rule: &'a PricingRule,
    pub matched: bool,
}

/// Evaluate every candidate rule for `property_id` and `target`.
pub fn applicable_rules<'a>(
    rules: &'a [PricingRule],
    property_id: Ulid,
    target: PricingTarget,
    stay: &Stay,
) -> Vec<RuleMatch<'a>> {
    rules
        .iter()
        .map(|rule| RuleMatch {
            rule,
            matched: rule_matches(rule, property_id, target, stay),
        })
        .collect()
}

fn rule_matches(rule: &PricingRule, property_id: Ulid, target: PricingTarget, stay: &Stay) -> bool {
    if !rule.active {
        return false;
    }
    if rule.property_id.is_some_and(|p| p != property_id) {
        return false;
    }
    let bound_here = match target {
        PricingTarget::Stay => rule.add_on_id.is_none(),
        PricingTarget::AddOn(id) => rule.add_on_id == Some(id),
    };
    if !bound_here {
        return false;
    }

    let check_in_day = stay.check_in.weekday();
    match (&rule.kind, target) {
        (RuleKind::LengthOfStay { minimum_nights }, _) => stay.nights() >= *minimum_nights,
        (
            RuleKind::Seasonal(w) | RuleKind::LastMinute(w) | RuleKind::AdvanceBooking(w),
            PricingTarget::Stay,
        ) => w.overlaps(stay),
        (
            RuleKind::Seasonal(w) | RuleKind::LastMinute(w) | RuleKind::AdvanceBooking(w),
            PricingTarget::AddOn(_),
        ) => w.contains(stay.check_in),
        (RuleKind::Weekend(days) | RuleKind::DayOfWeek(days), PricingTarget::Stay) => {
            stay.nights_iter().any(|night| days.contains(night.weekday()))
        }
        (RuleKind::Weekend(days) | RuleKind::DayOfWeek(days), PricingTarget::AddOn(_)) => {
            days.contains(check_in_day)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Adjustment {
    pub rule_id: Ulid,
    pub rule_type: &'static str,
    pub amount: Decimal,
}

/// Deltas of the matched rules against `base`, in rule-id order.
pub fn adjustments(matches: &[RuleMatch<'_>], base: Decimal) -> Vec<Adjustment> {
    matches
        .iter()
        .filter(|m| m.matched)
        .map(|m| Adjustment {
            rule_id: m.rule.id,
            rule_type: m.rule.kind.label(),
            amount: m.rule.modifier.delta(base),
        })
        .collect()
}

fn floored_sum(base: Decimal, adjustments: &[Adjustment]) -> Decimal {
    let total = adjustments.iter().fold(base, |acc, a| acc + a.amount);
    round_money(total.max(Decimal::ZERO))
}

#[derive(Debug, Clone, Serialize)]
pub struct AddOnLine {
    pub add_on_id: Ulid,
    pub name: String,
    pub base_price: Decimal,
    pub adjustments: Vec<Adjustment>,
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub property_id: Ulid,
    pub stay: Stay,
    pub nights: u32,
    pub whole_property: bool,
    /// Nightly accommodation rate times nights, before any rule.
    pub base_price: Decimal,
    pub adjustments: Vec<Adjustment>,
    /// `max(0, base_price + sum(adjustments))`.
    pub accommodation_price: Decimal,
    pub add_ons: Vec<AddOnLine>,
    pub total_price: Decimal,
}

impl Quote {
    pub fn adjustment_total(&self) -> Decimal {
        self.adjustments.iter().map(|a| a.amount).sum()
    }
}

/// Price a stay. `rooms` must already be resolved for `occupancy`.
pub fn calculate_price(
    ps: &PropertyState,
    rules: &[PricingRule],
    stay: &Stay,
    occupancy: &Occupancy,
    rooms: &[Ulid],
    add_on_ids: &[Ulid],
) -> Result<Quote, EngineError> {
    let nights = stay.nights();
    let nightly = match occupancy {
        Occupancy::WholeProperty => ps.property.whole_property_rate.ok_or_else(|| {
            EngineError::validation(format!(
                "property {} does not offer whole-property bookings",
                ps.property.id
            ))
        })?,
        Occupancy::Rooms(_) => {
            let mut sum = Decimal::ZERO;
            for id in rooms {
                let room = ps.room(id).ok_or(EngineError::NotFound(*id))?;
                sum += room.base_price;
            }
            sum
        }
    };
    let base_price = nightly * Decimal::from(nights);

    let property_id = ps.property.id;
    let stay_matches = applicable_rules(rules, property_id, PricingTarget::Stay, stay);
    let stay_adjustments = adjustments(&stay_matches, base_price);
    let accommodation_price = floored_sum(base_price, &stay_adjustments);

    let mut seen = HashSet::with_capacity(add_on_ids.len());
    let mut lines = Vec::with_capacity(add_on_ids.len());
    for id in add_on_ids {
        if !seen.insert(*id) {
            return Err(EngineError::validation(format!("add-on {id} listed twice")));
        }
        let add_on = ps.add_on(id).ok_or(EngineError::NotFound(*id))?;
        if !add_on.active {
            return Err(EngineError::validation(format!("add-on {id} is not available")));
        }
        let matches = applicable_rules(rules, property_id, PricingTarget::AddOn(*id), stay);
        let line_adjustments = adjustments(&matches, add_on.price);
        lines.push(AddOnLine {
            add_on_id: *id,
            name: add_on.name.clone(),
            base_price: add_on.price,
            price: floored_sum(add_on.price, &line_adjustments),
            adjustments: line_adjustments,
        });
    }

    let total_price = round_money(accommodation_price + lines.iter().map(|l| l.price).sum::<Decimal>());
    Ok(Quote {
        property_id,
        stay: *stay,
        nights,
        whole_property: occupancy.is_whole_property(),
        base_price: round_money(base_price),
        adjustments: stay_adjustments,
        accommodation_price,
        add_ons: lines,
        total_price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn stay(a: &str, b: &str) -> Stay {
        Stay::new(d(a), d(b))
    }

    fn rule(kind: RuleKind, modifier: Modifier) -> PricingRule {
        PricingRule {
            id: Ulid::new(),
            property_id: None,
            add_on_id: None,
            kind,
            modifier,
            active: true,
        }
    }

    fn pct(n: i64) -> Modifier {
        Modifier::Percentage(Decimal::from(n))
    }

    fn fixed(n: i64) -> Modifier {
        Modifier::Fixed(Decimal::from(n))
    }

    fn july() -> RuleKind {
        RuleKind::Seasonal(DateWindow {
            start: d("2025-07-01"),
            end: d("2025-07-31"),
        })
    }

    fn property_with(room_price: i64, whole_rate: Option<i64>) -> (PropertyState, Ulid) {
        let mut ps = PropertyState::new(Property {
            id: Ulid::new(),
            name: "corner-house".into(),
            check_in_time: None,
            check_out_time: None,
            whole_property_rate: whole_rate.map(Decimal::from),
        });
        let room = Room {
            id: Ulid::new(),
            property_id: ps.property.id,
            name: "lion-suite".into(),
            capacity: 2,
            bed_type: Some("king".into()),
            bathroom: Bathroom::Ensuite,
            base_price: Decimal::from(room_price),
            active: true,
            features: vec![],
        };
        let id = room.id;
        ps.rooms.push(room);
        (ps, id)
    }

    fn matched(rules: &[PricingRule], target: PricingTarget, s: &Stay) -> usize {
        applicable_rules(rules, Ulid::new(), target, s)
            .iter()
            .filter(|m| m.matched)
            .count()
    }

    #[test]
    fn rule_additivity_is_order_independent() {
        let rules = vec![rule(july(), pct(10)), rule(july(), fixed(5))];
        let s = stay("2025-07-10", "2025-07-11");
        let forward = adjustments(&applicable_rules(&rules, Ulid::new(), PricingTarget::Stay, &s), Decimal::from(100));
        let reversed_rules: Vec<PricingRule> = rules.iter().rev().cloned().collect();
        let backward = adjustments(
            &applicable_rules(&reversed_rules, Ulid::new(), PricingTarget::Stay, &s),
            Decimal::from(100),
        );
        let sum = |a: &[Adjustment]| a.iter().map(|x| x.amount).sum::<Decimal>();
        assert_eq!(sum(&forward), Decimal::from(15));
        assert_eq!(sum(&backward), Decimal::from(15));
    }

    #[test]
    fn inactive_and_foreign_rules_never_match() {
        let mut off = rule(july(), pct(10));
        off.active = false;
        let mut foreign = rule(july(), pct(10));
        foreign.property_id = Some(Ulid::new());
        let s = stay("2025-07-10", "2025-07-12");
        assert_eq!(matched(&[off, foreign], PricingTarget::Stay, &s), 0);
    }

    #[test]
    fn weekend_matches_any_night_of_stay() {
        let r = vec![rule(RuleKind::Weekend(DaySet::WEEKEND), pct(25))];
        // Thu -> Sat covers Thursday and Friday nights
        assert_eq!(matched(&r, PricingTarget::Stay, &stay("2025-06-05", "2025-06-07")), 1);
        // Sun -> Thu: no Friday or Saturday night
        assert_eq!(matched(&r, PricingTarget::Stay, &stay("2025-06-08", "2025-06-12")), 0);
        // checkout on Friday: Friday is not a night of the stay
        assert_eq!(matched(&r, PricingTarget::Stay, &stay("2025-06-03", "2025-06-06")), 0);
    }

    #[test]
    fn length_of_stay_is_a_trigger() {
        let r = vec![rule(RuleKind::LengthOfStay { minimum_nights: 7 }, pct(-10))];
        assert_eq!(matched(&r, PricingTarget::Stay, &stay("2025-03-01", "2025-03-08")), 1);
        assert_eq!(matched(&r, PricingTarget::Stay, &stay("2025-03-01", "2025-03-07")), 0);
    }

    #[test]
    fn add_on_rules_use_check_in_as_reference() {
        let add_on = Ulid::new();
        let mut breakfast_sunday = rule(RuleKind::DayOfWeek(DaySet::empty().with(chrono::Weekday::Sun)), fixed(5));
        breakfast_sunday.add_on_id = Some(add_on);
        let mut summer = rule(july(), pct(20));
        summer.add_on_id = Some(add_on);
        let rules = vec![breakfast_sunday, summer];

        // Sunday check-in, outside July
        assert_eq!(matched(&rules, PricingTarget::AddOn(add_on), &stay("2025-06-08", "2025-06-10")), 1);
        // Monday 30 June: window only overlaps the stay, check-in is outside it
        assert_eq!(matched(&rules, PricingTarget::AddOn(add_on), &stay("2025-06-30", "2025-07-02")), 0);
        // add-on rules never touch the stay and vice versa
        assert_eq!(matched(&rules, PricingTarget::Stay, &stay("2025-07-06", "2025-07-08")), 0);
        assert_eq!(matched(&rules, PricingTarget::AddOn(Ulid::new()), &stay("2025-07-06", "2025-07-08")), 0);
    }

    #[test]
    fn weekend_scenario_totals_300() {
        let (ps, lion) = property_with(120, None);
        let rules = vec![rule(RuleKind::Weekend(DaySet::WEEKEND), pct(25))];
        let occupancy = Occupancy::Rooms(vec![lion]);
        let quote = calculate_price(&ps, &rules, &stay("2025-06-06", "2025-06-08"), &occupancy, &[lion], &[]).unwrap();
        assert_eq!(quote.nights, 2);
        assert_eq!(quote.base_price, Decimal::from(240));
        assert_eq!(quote.adjustment_total(), Decimal::from(60));
        assert_eq!(quote.total_price, Decimal::from(300));
    }

    #[test]
    fn price_is_floored_at_zero() {
        let (ps, room) = property_with(50, None);
        let rules = vec![rule(RuleKind::LengthOfStay { minimum_nights: 1 }, fixed(-200))];
        let occupancy = Occupancy::Rooms(vec![room]);
        let quote = calculate_price(&ps, &rules, &stay("2025-02-01", "2025-02-02"), &occupancy, &[room], &[]).unwrap();
        assert_eq!(quote.base_price, Decimal::from(50));
        assert_eq!(quote.total_price, Decimal::ZERO);
    }

    #[test]
    fn whole_property_uses_flat_rate_not_room_sum() {
        let (ps, room) = property_with(120, Some(450));
        let quote = calculate_price(
            &ps,
            &[],
            &stay("2025-10-01", "2025-10-04"),
            &Occupancy::WholeProperty,
            &[room],
            &[],
        )
        .unwrap();
        assert_eq!(quote.base_price, Decimal::from(1350));
        assert!(quote.whole_property);

        let (no_rate, room) = property_with(120, None);
        assert!(matches!(
            calculate_price(&no_rate, &[], &stay("2025-10-01", "2025-10-04"), &Occupancy::WholeProperty, &[room], &[]),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn add_ons_priced_against_their_own_base() {
        let (mut ps, room) = property_with(100, None);
        let add_on = AddOn {
            id: Ulid::new(),
            property_id: ps.property.id,
            name: "breakfast".into(),
            price: Decimal::from(20),
            active: true,
        };
        let add_on_id = add_on.id;
        ps.add_ons.push(add_on);

        let mut surcharge = rule(july(), pct(50));
        surcharge.add_on_id = Some(add_on_id);
        // stay-level rule must not leak into the add-on price
        let stay_rule = rule(july(), pct(10));
        let rules = vec![surcharge, stay_rule];

        let occupancy = Occupancy::Rooms(vec![room]);
        let quote = calculate_price(&ps, &rules, &stay("2025-07-10", "2025-07-12"), &occupancy, &[room], &[add_on_id]).unwrap();
        assert_eq!(quote.accommodation_price, Decimal::from(220));
        assert_eq!(quote.add_ons[0].price, Decimal::from(30));
        assert_eq!(quote.total_price, Decimal::from(250));
    }

    #[test]
    fn unknown_or_inactive_add_on_is_rejected() {
        let (mut ps, room) = property_with(100, None);
        ps.add_ons.push(AddOn {
            id: Ulid::new(),
            property_id: ps.property.id,
            name: "late checkout".into(),
            price: Decimal::from(15),
            active: false,
        });
        let inactive = ps.add_ons[0].id;
        let occupancy = Occupancy::Rooms(vec![room]);
        let s = stay("2025-07-10", "2025-07-12");
        assert!(calculate_price(&ps, &[], &s, &occupancy, &[room], &[inactive]).is_err());
        assert!(matches!(
            calculate_price(&ps, &[], &s, &occupancy, &[room], &[Ulid::new()]),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn rounding_to_pennies() {
        let (ps, room) = property_with(33, None);
        let rules = vec![rule(july(), Modifier::Percentage(Decimal::new(125, 1)))];
        let occupancy = Occupancy::Rooms(vec![room]);
        let quote = calculate_price(&ps, &rules, &stay("2025-07-01", "2025-07-02"), &occupancy, &[room], &[]).unwrap();
        // 33 * 1.125 = 37.125 -> 37.13
        assert_eq!(quote.total_price, Decimal::new(3713, 2));
    }
}
