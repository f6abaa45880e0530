//! Reference evaluation of relational plans over a [`MemoryStore`].
//!
//! Joined rows carry each joined record nested under its alias, which is the
//! same shape a document lookup produces.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::engine::{MemoryStore, StorageError};
use super::populate::populate;
use super::predicate::predicate_holds;
use crate::data::{get_path, set_path, sort_records, value_at, Record, Value};
use crate::execution::{
    BackendResult, Populated, RelationalBackend, TransactionId, Transactional,
};
use crate::query::aggregates::create_accumulator;
use crate::query::descriptor::{AggregateOp, JoinType};
use crate::relational::{ColumnRef, JoinClause, PlanKind, ProjectionItem, RelationalPlan};
use crate::schema::PopulateNode;

/// Record path a column resolves to in a joined row
fn column_path(column: &ColumnRef, entity: &str) -> String {
    match &column.qualifier {
        Some(q) if q != entity => format!("{}.{}", q, column.name),
        _ => column.name.clone(),
    }
}

fn resolve(row: &Record, column: &ColumnRef, entity: &str) -> Value {
    value_at(row, &column_path(column, entity))
}

/// Rows of a data plan
pub fn evaluate(store: &MemoryStore, plan: &RelationalPlan) -> Result<Vec<Record>, StorageError> {
    let rows = filtered_rows(store, plan)?;

    let mut rows = if plan.is_grouped() {
        let mut grouped = group(plan, rows);
        sort_records(&mut grouped, &order_keys(plan));
        grouped
    } else {
        let mut rows = rows;
        sort_records(&mut rows, &order_keys(plan));
        rows
    };

    let skip = plan.skip().unwrap_or(0) as usize;
    let take = plan.take().map(|t| t as usize).unwrap_or(usize::MAX);
    rows = rows.into_iter().skip(skip).take(take).collect();

    if plan.is_grouped() {
        return Ok(rows);
    }
    let aliases: Vec<&str> = plan.joins().iter().map(|j| j.alias.as_str()).collect();
    Ok(rows
        .iter()
        .map(|row| project(plan, &aliases, row))
        .collect())
}

/// `total` of a count plan: filtered rows, or groups when grouping
pub fn evaluate_count(store: &MemoryStore, plan: &RelationalPlan) -> Result<u64, StorageError> {
    if plan.kind != PlanKind::Count {
        tracing::debug!("Counting the rows of a data plan for '{}'", plan.entity);
    }
    let rows = filtered_rows(store, plan)?;
    if !plan.is_grouped() {
        return Ok(rows.len() as u64);
    }
    Ok(group_keys(plan, &rows).len() as u64)
}

fn filtered_rows(store: &MemoryStore, plan: &RelationalPlan) -> Result<Vec<Record>, StorageError> {
    let mut rows = store.scan(&plan.entity)?;
    for join in plan.joins() {
        let source = store.scan(&join.source)?;
        rows = apply_join(rows, join, &source, &plan.entity);
    }

    let predicates = plan.predicates();
    if predicates.is_empty() {
        return Ok(rows);
    }
    let entity = plan.entity.as_str();
    Ok(rows
        .into_iter()
        .filter(|row| {
            let column = |c: &ColumnRef| resolve(row, c, entity);
            predicates
                .iter()
                .all(|p| predicate_holds(p, &plan.params, &column))
        })
        .collect())
}

fn apply_join(rows: Vec<Record>, join: &JoinClause, source: &[Record], entity: &str) -> Vec<Record> {
    let mut index: HashMap<Value, Vec<usize>> = HashMap::new();
    for (i, record) in source.iter().enumerate() {
        let key = value_at(record, &join.right.name);
        if !key.is_null() {
            index.entry(key).or_default().push(i);
        }
    }

    let left = column_path(&join.left, entity);
    let keep_unmatched_left = matches!(join.join_type, JoinType::Left | JoinType::Full);
    let keep_unmatched_right = matches!(join.join_type, JoinType::Right | JoinType::Full);
    let mut matched = vec![false; source.len()];
    let mut out = Vec::with_capacity(rows.len());

    for mut row in rows {
        let key = value_at(&row, &left);
        let hits = if key.is_null() {
            None
        } else {
            index.get(&key)
        };
        match hits {
            Some(hits) => {
                for &i in hits {
                    matched[i] = true;
                    let mut joined = row.clone();
                    joined.insert(join.alias.clone(), Value::Object(source[i].clone()));
                    out.push(joined);
                }
            }
            None if keep_unmatched_left => {
                row.remove(&join.alias);
                out.push(row);
            }
            None => {}
        }
    }

    if keep_unmatched_right {
        for (i, record) in source.iter().enumerate() {
            if !matched[i] {
                let mut row = Record::new();
                row.insert(join.alias.clone(), Value::Object(record.clone()));
                out.push(row);
            }
        }
    }
    out
}

fn order_keys(plan: &RelationalPlan) -> Vec<(String, bool)> {
    plan.order_by()
        .iter()
        .map(|item| (column_path(&item.column, &plan.entity), item.descending))
        .collect()
}

/// Distinct group keys in first-appearance order; one empty key for an aggregate over all rows
fn group_keys(plan: &RelationalPlan, rows: &[Record]) -> Vec<(Vec<Value>, Vec<usize>)> {
    let columns = plan.group_by();
    if columns.is_empty() {
        return vec![(Vec::new(), (0..rows.len()).collect())];
    }
    let mut positions: HashMap<Vec<Value>, usize> = HashMap::new();
    let mut groups: Vec<(Vec<Value>, Vec<usize>)> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let key: Vec<Value> = columns
            .iter()
            .map(|c| resolve(row, c, &plan.entity))
            .collect();
        match positions.get(&key) {
            Some(&g) => groups[g].1.push(i),
            None => {
                positions.insert(key.clone(), groups.len());
                groups.push((key, vec![i]));
            }
        }
    }
    groups
}

fn group(plan: &RelationalPlan, rows: Vec<Record>) -> Vec<Record> {
    let entity = plan.entity.as_str();
    let groups = group_keys(plan, &rows);
    groups
        .into_iter()
        .map(|(_, members)| {
            let members: Vec<&Record> = members.iter().map(|&i| &rows[i]).collect();
            let mut out = Record::new();
            for item in plan.projection() {
                match item {
                    ProjectionItem::Column { column, alias } => {
                        let value = members
                            .first()
                            .map(|row| resolve(row, column, entity))
                            .unwrap_or(Value::Null);
                        set_path(&mut out, alias.as_deref().unwrap_or(&column.name), value);
                    }
                    ProjectionItem::Aggregate {
                        op,
                        column,
                        alias,
                        filter,
                    } => {
                        let mut acc = if *op == AggregateOp::Count && filter.is_some() {
                            create_accumulator(AggregateOp::Count, None)
                        } else {
                            create_accumulator(*op, column.as_ref().map(|c| c.name.as_str()))
                        };
                        for row in &members {
                            let included = filter.as_ref().map_or(true, |f| {
                                let resolve_column = |c: &ColumnRef| resolve(row, c, entity);
                                predicate_holds(f, &plan.params, &resolve_column)
                            });
                            if included {
                                let value = column
                                    .as_ref()
                                    .map(|c| resolve(row, c, entity))
                                    .unwrap_or(Value::Null);
                                acc.accumulate(&value);
                            }
                        }
                        set_path(&mut out, alias, acc.result());
                    }
                    ProjectionItem::CountAll { alias } => {
                        set_path(&mut out, alias, Value::Int64(members.len() as i64));
                    }
                    ProjectionItem::AllColumns { .. } => {}
                }
            }
            out
        })
        .collect()
}

fn project(plan: &RelationalPlan, aliases: &[&str], row: &Record) -> Record {
    let mut out = Record::new();
    for item in plan.projection() {
        match item {
            ProjectionItem::AllColumns { qualifier } if qualifier == &plan.entity => {
                for (field, value) in row {
                    if !aliases.contains(&field.as_str()) {
                        out.insert(field.clone(), value.clone());
                    }
                }
            }
            ProjectionItem::AllColumns { qualifier } => {
                if let Some(joined) = row.get(qualifier) {
                    out.insert(qualifier.clone(), joined.clone());
                }
            }
            ProjectionItem::Column { column, alias } => {
                if let Some(value) = get_path(row, &column_path(column, &plan.entity)) {
                    set_path(&mut out, alias.as_deref().unwrap_or(&column.name), value.clone());
                }
            }
            ProjectionItem::CountAll { alias } => {
                set_path(&mut out, alias, Value::Int64(1));
            }
            ProjectionItem::Aggregate { .. } => {}
        }
    }
    out
}

/// [`RelationalBackend`] over a shared [`MemoryStore`]
pub struct MemoryRelationalBackend {
    store: Arc<MemoryStore>,
}

impl MemoryRelationalBackend {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[async_trait]
impl Transactional for MemoryRelationalBackend {
    async fn begin(&self) -> BackendResult<TransactionId> {
        self.store.enter("begin", "").await?;
        Ok(self.store.begin())
    }

    async fn commit(&self, tx: TransactionId) -> BackendResult<()> {
        self.store.enter("commit", "").await?;
        self.store.commit(tx).map_err(|e| e.into_backend("commit", ""))
    }

    async fn rollback(&self, tx: TransactionId) -> BackendResult<()> {
        self.store.enter("rollback", "").await?;
        self.store.rollback(tx).map_err(|e| e.into_backend("rollback", ""))
    }
}

#[async_trait]
impl RelationalBackend for MemoryRelationalBackend {
    async fn fetch(&self, plan: &RelationalPlan) -> BackendResult<Vec<Record>> {
        self.store.enter("fetch", &plan.entity).await?;
        evaluate(&self.store, plan)
            .map_err(|e| e.into_backend("fetch", &plan.entity).with_context(plan.to_sql()))
    }

    async fn count(&self, plan: &RelationalPlan) -> BackendResult<u64> {
        self.store.enter("count", &plan.entity).await?;
        evaluate_count(&self.store, plan)
            .map_err(|e| e.into_backend("count", &plan.entity).with_context(plan.to_sql()))
    }

    async fn populate(
        &self,
        entity: &str,
        records: Vec<Record>,
        relations: &[PopulateNode],
    ) -> BackendResult<Populated> {
        self.store.enter("populate", entity).await?;
        Ok(populate(&self.store, entity, records, relations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::descriptor::{AggregationSpec, JoinSpec, QueryDescriptor, SortDirection};
    use crate::query::QueryContext;
    use crate::relational::RelationalCompiler;
    use serde_json::json;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_json(
            "users",
            &[
                json!({"id": 1, "name": "Ada", "status": "ACTIVE", "region": "EU", "companyId": 10}),
                json!({"id": 2, "name": "Bob", "status": "INACTIVE", "region": "EU", "companyId": 11}),
                json!({"id": 3, "name": "Cy", "status": "ACTIVE", "region": "US", "companyId": 99}),
            ],
        );
        store.insert_json(
            "companies",
            &[
                json!({"id": 10, "name": "Initech"}),
                json!({"id": 11, "name": "Hooli"}),
                json!({"id": 12, "name": "Umbrella"}),
            ],
        );
        store
    }

    fn compile(descriptor: &QueryDescriptor) -> crate::relational::CompiledRelational {
        let ctx = QueryContext::new("users", "id");
        RelationalCompiler::new(&ctx).compile(descriptor)
    }

    fn ids(rows: &[Record]) -> Vec<i64> {
        rows.iter().filter_map(|r| r.get("id").and_then(Value::as_i64)).collect()
    }

    #[test]
    fn test_filter_sort_and_page() {
        let store = store();
        let compiled = compile(
            &QueryDescriptor::new()
                .with_condition("status", "ACTIVE")
                .with_pagination(1, 1),
        );
        let rows = evaluate(&store, &compiled.data).unwrap();
        assert_eq!(ids(&rows), vec![3]);
        assert_eq!(evaluate_count(&store, &compiled.count).unwrap(), 2);
    }

    #[test]
    fn test_join_types() {
        let store = store();
        let join = JoinSpec::new("companies", "companyId", "id").with_alias("company");

        let left = compile(&QueryDescriptor::new().with_join(join.clone()));
        let rows = evaluate(&store, &left.data).unwrap();
        assert_eq!(rows.len(), 3);
        let ada = rows.iter().find(|r| r["id"] == Value::Int64(1)).unwrap();
        assert_eq!(value_at(ada, "company.name"), Value::from("Initech"));
        let cy = rows.iter().find(|r| r["id"] == Value::Int64(3)).unwrap();
        assert!(cy.get("company").is_none());

        let inner = compile(&QueryDescriptor::new().with_join(join.clone().with_type(JoinType::Inner)));
        assert_eq!(evaluate_count(&store, &inner.count).unwrap(), 2);

        let right = compile(&QueryDescriptor::new().with_join(join.clone().with_type(JoinType::Right)));
        assert_eq!(evaluate_count(&store, &right.count).unwrap(), 3);

        let full = compile(&QueryDescriptor::new().with_join(join.with_type(JoinType::Full)));
        assert_eq!(evaluate_count(&store, &full.count).unwrap(), 4);
    }

    #[test]
    fn test_grouped_conditional_count() {
        let store = store();
        let compiled = compile(
            &QueryDescriptor::new()
                .with_group_by("region")
                .with_aggregation(
                    AggregationSpec::new(AggregateOp::Count, "status")
                        .with_alias("active")
                        .with_condition("status", "ACTIVE"),
                )
                .with_aggregation(AggregationSpec::count_all().with_alias("users"))
                .with_sort("region", SortDirection::Asc),
        );
        let rows = evaluate(&store, &compiled.data).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["region"], Value::from("EU"));
        assert_eq!(rows[0]["active"], Value::Int64(1));
        assert_eq!(rows[0]["users"], Value::Int64(2));
        assert_eq!(rows[1]["active"], Value::Int64(1));
        assert_eq!(evaluate_count(&store, &compiled.count).unwrap(), 2);
    }

    #[test]
    fn test_group_all_yields_one_row() {
        let store = store();
        let compiled = compile(
            &QueryDescriptor::new()
                .with_condition("status", "MISSING")
                .with_aggregation(AggregationSpec::count_all().with_alias("n")),
        );
        let rows = evaluate(&store, &compiled.data).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"], Value::Int64(0));
        assert_eq!(evaluate_count(&store, &compiled.count).unwrap(), 1);
    }

    #[test]
    fn test_missing_table_is_an_error() {
        let store = MemoryStore::new();
        let compiled = compile(&QueryDescriptor::new());
        assert!(matches!(
            evaluate(&store, &compiled.data),
            Err(StorageError::TableNotFound(_))
        ));
    }
}
