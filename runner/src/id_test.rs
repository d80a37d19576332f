use crate::id::{BenchmarkId, GroupId, Id, IdError, ResultKind};

#[test]
pub fn carries_prefix() {
    let id = BenchmarkId::new();
    let group = GroupId::new();

    assert!(id.as_str().starts_with("bmk_"));
    assert!(group.as_str().starts_with("bmkgrp_"));
    assert_eq!(id.as_str().len(), "bmk_".len() + 32);
}

#[test]
pub fn sorts_by_creation() {
    let ids = (0..512).map(|_| BenchmarkId::new()).collect::<Vec<_>>();
    let mut sorted = ids.clone();
    sorted.sort();

    assert_eq!(ids, sorted);
    assert!(ids.windows(2).all(|pair| pair[0].as_str() < pair[1].as_str()));
}

#[test]
pub fn parse_round_trips() {
    let id = GroupId::new();
    let parsed: GroupId = id.as_str().parse().unwrap();

    assert_eq!(id, parsed);
}

#[test]
pub fn parse_rejects_foreign_prefix() {
    let benchmark = BenchmarkId::new();

    // "bmkgrp_" starts with "bmk" but not with "bmk_"
    assert!(matches!(
        BenchmarkId::parse(GroupId::new().as_str()),
        Err(IdError::Prefix { expected: "bmk", .. })
    ));
    assert!(matches!(
        GroupId::parse(benchmark.as_str()),
        Err(IdError::Prefix { .. })
    ));
}

#[test]
pub fn parse_rejects_bad_suffix() {
    assert!(matches!(
        Id::<ResultKind>::parse("bmkres_nothex"),
        Err(IdError::Suffix(_))
    ));
    assert!(matches!(
        BenchmarkId::parse("bmk_0123456789abcdef0123456789abcdeg"),
        Err(IdError::Suffix(_))
    ));
}
