//! Property tests for predicate evaluation and resume tokens

use ipnet::{IpNet, Ipv4Net};
use mmdb_mcp::filter::{FilterEngine, FilterMode, Operator, Predicate};
use mmdb_mcp::iterator::ResumeToken;
use mmdb_mcp::DataValue;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::Ipv4Addr;

const FIELDS: [&str; 3] = ["a", "b", "c"];

fn arb_field() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(FIELDS[0].to_string()),
        Just(FIELDS[1].to_string()),
        Just(FIELDS[2].to_string()),
    ]
}

fn arb_data_value() -> impl Strategy<Value = DataValue> {
    prop_oneof![
        prop_oneof![Just("US"), Just("CA"), Just("DE"), Just("")]
            .prop_map(|s| DataValue::String(s.to_string())),
        (0u32..20).prop_map(DataValue::Uint32),
        (-10i32..10).prop_map(DataValue::Int32),
        any::<bool>().prop_map(DataValue::Bool),
    ]
}

/// Each field is present or absent
fn arb_record() -> impl Strategy<Value = DataValue> {
    prop::collection::vec(prop::option::of(arb_data_value()), 3).prop_map(|values| {
        let map: HashMap<String, DataValue> = FIELDS
            .iter()
            .zip(values)
            .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
            .collect();
        DataValue::Map(map)
    })
}

fn arb_scalar_json() -> impl Strategy<Value = Value> {
    prop_oneof![
        prop_oneof![Just("US"), Just("CA"), Just("DE"), Just("")].prop_map(|s| json!(s)),
        (-10i64..20).prop_map(|n| json!(n)),
        any::<bool>().prop_map(|b| json!(b)),
    ]
}

fn arb_predicate() -> impl Strategy<Value = Predicate> {
    let scalar_ops = prop_oneof![
        Just(Operator::Equals),
        Just(Operator::NotEquals),
        Just(Operator::Contains),
        Just(Operator::GreaterThan),
        Just(Operator::GreaterThanOrEqual),
        Just(Operator::LessThan),
        Just(Operator::LessThanOrEqual),
    ];
    prop_oneof![
        (arb_field(), scalar_ops, arb_scalar_json())
            .prop_map(|(f, op, v)| Predicate::new(f, op, v)),
        (
            arb_field(),
            prop_oneof![Just(Operator::In), Just(Operator::NotIn)],
            prop::collection::vec(arb_scalar_json(), 0..4),
        )
            .prop_map(|(f, op, v)| Predicate::new(f, op, Value::Array(v))),
        (arb_field(), any::<bool>())
            .prop_map(|(f, b)| Predicate::new(f, Operator::Exists, json!(b))),
    ]
}

fn single(p: &Predicate, record: &DataValue) -> bool {
    FilterEngine::new(vec![p.clone()], FilterMode::All).matches(record)
}

fn negated(op: Operator) -> Option<Operator> {
    match op {
        Operator::Equals => Some(Operator::NotEquals),
        Operator::NotEquals => Some(Operator::Equals),
        Operator::In => Some(Operator::NotIn),
        Operator::NotIn => Some(Operator::In),
        _ => None,
    }
}

proptest! {
    #[test]
    fn empty_predicates_match_everything(record in arb_record()) {
        prop_assert!(FilterEngine::new(Vec::new(), FilterMode::All).matches(&record));
        prop_assert!(FilterEngine::new(Vec::new(), FilterMode::Any).matches(&record));
    }

    #[test]
    fn modes_combine_single_results(
        predicates in prop::collection::vec(arb_predicate(), 1..5),
        record in arb_record(),
    ) {
        let each: Vec<bool> = predicates.iter().map(|p| single(p, &record)).collect();
        let all = FilterEngine::new(predicates.clone(), FilterMode::All).matches(&record);
        let any = FilterEngine::new(predicates, FilterMode::Any).matches(&record);
        prop_assert_eq!(all, each.iter().all(|m| *m));
        prop_assert_eq!(any, each.iter().any(|m| *m));
    }

    #[test]
    fn single_predicate_is_mode_independent(p in arb_predicate(), record in arb_record()) {
        let all = FilterEngine::new(vec![p.clone()], FilterMode::All).matches(&record);
        let any = FilterEngine::new(vec![p], FilterMode::Any).matches(&record);
        prop_assert_eq!(all, any);
    }

    #[test]
    fn negated_operators_are_complements(p in arb_predicate(), record in arb_record()) {
        if let Some(op) = negated(p.operator) {
            let flipped = Predicate::new(p.field.clone(), op, p.value.clone());
            prop_assert_ne!(single(&p, &record), single(&flipped, &record));
        }
    }

    #[test]
    fn absent_fields_only_match_negations(p in arb_predicate()) {
        let empty = DataValue::Map(HashMap::new());
        let expected = match p.operator {
            Operator::NotEquals | Operator::NotIn => true,
            Operator::Exists => p.value == json!(false),
            _ => false,
        };
        prop_assert_eq!(single(&p, &empty), expected);
    }

    #[test]
    fn integer_ordering_matches_native(a in -1000i32..1000, b in -1000i64..1000) {
        let mut map = HashMap::new();
        map.insert("n".to_string(), DataValue::Int32(a));
        let record = DataValue::Map(map);
        let check = |op| single(&Predicate::new("n", op, json!(b)), &record);

        let a = i64::from(a);
        prop_assert_eq!(check(Operator::GreaterThan), a > b);
        prop_assert_eq!(check(Operator::GreaterThanOrEqual), a >= b);
        prop_assert_eq!(check(Operator::LessThan), a < b);
        prop_assert_eq!(check(Operator::LessThanOrEqual), a <= b);
        prop_assert_eq!(check(Operator::Equals), a == b);
    }

    #[test]
    fn resume_token_round_trip(
        database in "[A-Za-z0-9._-]{1,24}",
        addr in any::<u32>(),
        prefix in 0u8..=32,
        predicates in prop::collection::vec(arb_predicate(), 0..4),
        any_mode in any::<bool>(),
        processed in any::<u64>(),
        matched in any::<u64>(),
        has_last in any::<bool>(),
    ) {
        let network = IpNet::V4(Ipv4Net::new(Ipv4Addr::from(addr), prefix).unwrap().trunc());
        let token = ResumeToken {
            database,
            network: network.to_string(),
            filter_mode: if any_mode { FilterMode::Any } else { FilterMode::All },
            filters: predicates,
            processed,
            matched,
            last_network: if has_last { network.to_string() } else { String::new() },
        };

        let decoded = ResumeToken::decode(&token.encode()).unwrap();
        prop_assert_eq!(&decoded, &token);
        prop_assert_eq!(decoded.network().unwrap(), network);
        prop_assert_eq!(decoded.last_network().unwrap(), has_last.then_some(network));
    }
}
