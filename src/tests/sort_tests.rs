//! Sort-family integration: external sort feeding the merge join, checked
//! against a nested-loop reference on randomized inputs.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::catalog::{Column, DataType, Schema, SchemaRef};
use crate::execution::{QueryOperator, SortMergeJoinOperator, SortOperator, ValuesOperator};
use crate::storage::Tuple;
use crate::utils::scalar::ScalarValue;

fn schema(value_col: &str) -> SchemaRef {
    Arc::new(Schema::new(vec![
        Column::new("k", DataType::Int32),
        Column::new(value_col, DataType::Int64),
    ]))
}

fn row(schema: &SchemaRef, k: i32, v: i64) -> Tuple {
    Tuple::new(
        schema.clone(),
        vec![ScalarValue::from(k), ScalarValue::from(v)],
    )
}

fn int32(value: &ScalarValue) -> i32 {
    match value {
        ScalarValue::Int32(Some(v)) => *v,
        other => panic!("unexpected value {:?}", other),
    }
}

fn int64(value: &ScalarValue) -> i64 {
    match value {
        ScalarValue::Int64(Some(v)) => *v,
        other => panic!("unexpected value {:?}", other),
    }
}

#[test]
fn multi_pass_sort_produces_total_order() {
    // Small enough blocks that several merge passes are required.
    let s = schema("v");
    let mut rng = rand::thread_rng();
    let mut keys: Vec<i32> = (0..500).collect();
    keys.shuffle(&mut rng);
    let rows: Vec<Tuple> = keys.iter().map(|k| row(&s, *k, *k as i64)).collect();

    let op = SortOperator::new(Box::new(ValuesOperator::new(s, rows)), "k", 3)
        .unwrap()
        .with_records_per_page(4);
    let sorted = op.sort().unwrap();
    assert_eq!(sorted.len(), 500);
    let out: Vec<i32> = sorted.records().iter().map(|t| int32(t.value(0))).collect();
    assert_eq!(out, (0..500).collect::<Vec<_>>());
}

#[test]
fn join_matches_nested_loop_reference() {
    let ls = schema("lv");
    let rs = schema("rv");
    let mut rng = rand::thread_rng();

    let left_rows: Vec<Tuple> = (0..120)
        .map(|i| row(&ls, rng.gen_range(0..25), i))
        .collect();
    let right_rows: Vec<Tuple> = (0..90)
        .map(|i| row(&rs, rng.gen_range(0..25), 1000 + i))
        .collect();

    // Reference: every cross pair with equal keys, one entry per pair.
    let mut expected: Vec<(i64, i64)> = Vec::new();
    for l in &left_rows {
        for r in &right_rows {
            if int32(l.value(0)) == int32(r.value(0)) {
                expected.push((int64(l.value(1)), int64(r.value(1))));
            }
        }
    }
    expected.sort_unstable();

    let join = SortMergeJoinOperator::new(
        Box::new(ValuesOperator::new(ls, left_rows)),
        Box::new(ValuesOperator::new(rs, right_rows)),
        "k",
        "k",
        4,
    )
    .unwrap();
    let mut actual: Vec<(i64, i64)> = join
        .iterator()
        .unwrap()
        .map(|t| (int64(t.value(1)), int64(t.value(3))))
        .collect();
    actual.sort_unstable();

    assert_eq!(actual, expected);
}

#[test]
fn join_output_is_sorted_on_the_key() {
    let ls = schema("lv");
    let rs = schema("rv");
    let mut rng = rand::thread_rng();
    let left_rows: Vec<Tuple> = (0..60).map(|i| row(&ls, rng.gen_range(0..10), i)).collect();
    let right_rows: Vec<Tuple> = (0..60)
        .map(|i| row(&rs, rng.gen_range(0..10), i))
        .collect();

    let join = SortMergeJoinOperator::new(
        Box::new(ValuesOperator::new(ls, left_rows)),
        Box::new(ValuesOperator::new(rs, right_rows)),
        "k",
        "k",
        4,
    )
    .unwrap();
    let keys: Vec<i32> = join
        .iterator()
        .unwrap()
        .map(|t| int32(t.value(0)))
        .collect();
    let mut sorted_keys = keys.clone();
    sorted_keys.sort_unstable();
    assert_eq!(keys, sorted_keys);
}

#[test]
fn sorted_run_is_reiterable() {
    let s = schema("v");
    let rows = vec![row(&s, 3, 0), row(&s, 1, 1), row(&s, 2, 2)];
    let op = SortOperator::new(Box::new(ValuesOperator::new(s, rows)), "k", 3).unwrap();

    let first: Vec<i32> = op
        .iterator()
        .unwrap()
        .map(|t| int32(t.value(0)))
        .collect();
    let second: Vec<i32> = op
        .iterator()
        .unwrap()
        .map(|t| int32(t.value(0)))
        .collect();
    assert_eq!(first, vec![1, 2, 3]);
    assert_eq!(first, second);
}
