//! Shared fixtures for integration tests.

#![allow(dead_code)]

use lineage_core::model::{AssetContext, AssetRef, Element, RelationshipEvent};
use lineage_core::schema::{EdgeLabel, VertexLabel};
use lineage_core::store::{GraphStore, GraphTransaction, MemoryGraphStore};
use lineage_core::VertexData;
use std::sync::Arc;

/// Table `t{table}` in schema `s{host}` on host `h{host}`. Element
/// properties depend only on the guid, so ingestion order never matters.
pub fn table_context(table: usize, host: usize) -> AssetContext {
    let mut ctx = AssetContext::new();
    ctx.insert(
        VertexLabel::Table,
        Element::new(format!("t{table}"), format!("db.t{table}"), VertexLabel::Table)
            .with_property("displayName", format!("table {table}")),
    );
    ctx.insert(
        VertexLabel::SchemaType,
        Element::new(format!("s{host}"), format!("h{host}.s"), VertexLabel::SchemaType),
    );
    ctx.insert(
        VertexLabel::Host,
        Element::new(format!("h{host}"), format!("h{host}"), VertexLabel::Host)
            .with_property("displayName", format!("host {host}")),
    );
    ctx
}

pub fn glossary_term(term: usize) -> Element {
    Element::new(format!("g{term}"), format!("Glossary::term{term}"), VertexLabel::GlossaryTerm)
        .with_property("glossary", "Sales")
}

/// Assign term `g{term}` to column `t{table}c{column}`.
pub fn column_event(term: usize, table: usize, column: usize, host: usize) -> RelationshipEvent {
    let guid = format!("t{table}c{column}");
    let mut ctx = table_context(table, host);
    ctx.insert(
        VertexLabel::Column,
        Element::new(guid.clone(), format!("db.t{table}.c{column}"), VertexLabel::Column)
            .with_property("tableDisplayname", format!("table {table}")),
    );
    RelationshipEvent {
        glossary_term: glossary_term(term),
        asset_context: ctx,
        base_asset: AssetRef {
            guid,
            asset_type: VertexLabel::Column,
        },
    }
}

/// Assign term `g{term}` to table `t{table}`.
pub fn table_event(term: usize, table: usize, host: usize) -> RelationshipEvent {
    RelationshipEvent {
        glossary_term: glossary_term(term),
        asset_context: table_context(table, host),
        base_asset: AssetRef {
            guid: format!("t{table}"),
            asset_type: VertexLabel::Table,
        },
    }
}

/// `n0 -> n1 -> ... -> n{hops}` over `processColumn` edges, alternating
/// columns (even positions) and processes (odd positions).
pub fn linear_flow(hops: usize) -> Arc<MemoryGraphStore> {
    let store = Arc::new(MemoryGraphStore::new());
    let mut tx = store.begin().unwrap();
    let mut prev = None;
    for i in 0..=hops {
        let label = if i % 2 == 0 {
            VertexLabel::Column
        } else {
            VertexLabel::Process
        };
        let guid = format!("n{i}");
        let id = tx
            .create_vertex(&VertexData::new(label, guid.clone(), guid))
            .unwrap();
        if let Some(p) = prev {
            tx.insert_edge_if_absent(EdgeLabel::ColumnAndProcess, p, id)
                .unwrap();
        }
        prev = Some(id);
    }
    tx.commit().unwrap();
    store
}
