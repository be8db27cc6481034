//! Synthetic lineage graphs of a parametrised size.
//!
//! A flow is a path between the columns of consecutive tables through
//! process vertices: `t0c0 -> p0 -> t1c0 -> p1 -> t2c0`. The tables are
//! wired the same way, and every column is assigned to one glossary term
//! picked by a seeded RNG, so the same parameters always give the same graph.

use crate::error::StoreError;
use crate::model::{VertexData, VertexId};
use crate::schema::{EdgeLabel, VertexLabel};
use crate::store::{GraphStore, GraphTransaction};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Size of the graph to generate. There are no defaults: every count is
/// supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorParams {
    pub glossary_terms: usize,
    pub flows: usize,
    pub processes_per_flow: usize,
    pub columns_per_table: usize,
    /// RNG seed for glossary assignment. Derived from the counts when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl GeneratorParams {
    pub fn new(
        glossary_terms: usize,
        flows: usize,
        processes_per_flow: usize,
        columns_per_table: usize,
    ) -> Self {
        Self {
            glossary_terms,
            flows,
            processes_per_flow,
            columns_per_table,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn tables_per_flow(&self) -> usize {
        self.processes_per_flow + 1
    }

    pub fn number_tables(&self) -> usize {
        self.flows * self.tables_per_flow()
    }

    pub fn number_processes(&self) -> usize {
        self.flows * self.processes_per_flow
    }

    /// The explicit seed, or an FNV-1a mix of the four counts.
    pub fn effective_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            [
                self.glossary_terms,
                self.flows,
                self.processes_per_flow,
                self.columns_per_table,
            ]
            .iter()
            .fold(0xcbf2_9ce4_8422_2325, |hash, &n| {
                (hash ^ n as u64).wrapping_mul(0x0000_0100_0000_01b3)
            })
        })
    }
}

/// Derived counts and the expected totals for a parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphSizeSummary {
    pub glossary_terms: usize,
    pub flows: usize,
    pub processes_per_flow: usize,
    pub columns_per_table: usize,
    pub tables_per_flow: usize,
    pub number_tables: usize,
    pub number_processes: usize,
    /// `G + P + T * (2 + C)`: glossary terms, processes, and per table one
    /// table, one host and its columns.
    pub vertices: usize,
    /// `T * (1 + C + C * [G > 0]) + F * Pf * (2 + 2C)`.
    pub edges: usize,
    pub seed: u64,
}

impl GraphSizeSummary {
    pub fn expected(params: &GeneratorParams) -> Self {
        let g = params.glossary_terms;
        let c = params.columns_per_table;
        let t = params.number_tables();
        let p = params.number_processes();
        let semantic = if g > 0 { c } else { 0 };
        Self {
            glossary_terms: g,
            flows: params.flows,
            processes_per_flow: params.processes_per_flow,
            columns_per_table: c,
            tables_per_flow: params.tables_per_flow(),
            number_tables: t,
            number_processes: p,
            vertices: g + p + t * (2 + c),
            edges: t * (1 + c + semantic) + p * (2 + 2 * c),
            seed: params.effective_seed(),
        }
    }
}

fn vertex(label: VertexLabel, guid: String, display: String) -> VertexData {
    VertexData::new(label, guid.clone(), format!("mock::{guid}")).with_display_name(display)
}

/// Writes synthetic graphs into an otherwise unused store.
pub struct GraphGenerator<S: GraphStore> {
    store: Arc<S>,
}

impl<S: GraphStore> GraphGenerator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Generate the graph in one transaction and verify the store's counts
    /// against the expected totals.
    pub fn generate(&self, params: &GeneratorParams) -> Result<GraphSizeSummary, StoreError> {
        let existing = self.store.counts()?.vertices;
        if existing > 0 {
            return Err(StoreError::NotEmpty { vertices: existing });
        }
        let summary = GraphSizeSummary::expected(params);
        let mut rng = StdRng::seed_from_u64(summary.seed);
        let mut tx = self.store.begin()?;
        let mut edges = 0usize;

        let glossary: Vec<VertexId> = (0..params.glossary_terms)
            .map(|i| {
                tx.create_vertex(&vertex(
                    VertexLabel::GlossaryTerm,
                    format!("g{i}"),
                    format!("Glossary term {i}"),
                ))
            })
            .collect::<Result<_, _>>()?;
        let processes: Vec<VertexId> = (0..summary.number_processes)
            .map(|i| {
                tx.create_vertex(&vertex(
                    VertexLabel::Process,
                    format!("p{i}"),
                    format!("Process {i}"),
                ))
            })
            .collect::<Result<_, _>>()?;

        let no_props = BTreeMap::new();
        let mut tables = Vec::with_capacity(summary.number_tables);
        let mut columns: Vec<Vec<VertexId>> = Vec::with_capacity(summary.number_tables);
        for j in 0..summary.number_tables {
            let table = tx.create_vertex(&vertex(
                VertexLabel::Table,
                format!("t{j}"),
                format!("Table {j}"),
            ))?;
            let host = tx.create_vertex(&vertex(
                VertexLabel::Host,
                format!("h{j}"),
                format!("Host {j}"),
            ))?;
            tx.create_edge(EdgeLabel::IncludedIn, table, host, &no_props)?;
            edges += 1;

            let mut table_columns = Vec::with_capacity(params.columns_per_table);
            for i in 0..params.columns_per_table {
                let column = tx.create_vertex(&vertex(
                    VertexLabel::Column,
                    format!("t{j}c{i}"),
                    format!("Column {i} of table {j}"),
                ))?;
                tx.create_edge(EdgeLabel::IncludedIn, column, table, &no_props)?;
                edges += 1;
                if !glossary.is_empty() {
                    let term = glossary[rng.gen_range(0..glossary.len())];
                    tx.create_edge(EdgeLabel::SemanticAssignment, column, term, &no_props)?;
                    edges += 1;
                }
                table_columns.push(column);
            }
            tables.push(table);
            columns.push(table_columns);
        }

        let tpf = summary.tables_per_flow;
        let ppf = params.processes_per_flow;
        for k in 0..params.flows {
            for j in 0..ppf {
                let process = processes[k * ppf + j];
                let (upstream, downstream) = (k * tpf + j, k * tpf + j + 1);
                tx.create_edge(EdgeLabel::TableAndProcess, tables[upstream], process, &no_props)?;
                tx.create_edge(EdgeLabel::TableAndProcess, process, tables[downstream], &no_props)?;
                edges += 2;
                for i in 0..params.columns_per_table {
                    let (from, to) = (columns[upstream][i], columns[downstream][i]);
                    tx.create_edge(EdgeLabel::ColumnAndProcess, from, process, &no_props)?;
                    tx.create_edge(EdgeLabel::ColumnAndProcess, process, to, &no_props)?;
                    edges += 2;
                }
            }
            debug!(flow = k, "flow wired");
        }

        if edges != summary.edges {
            return Err(StoreError::Corrupt(format!(
                "generator wired {edges} edges, expected {}",
                summary.edges
            )));
        }
        tx.commit()?;

        let counts = self.store.counts()?;
        if counts.vertices != summary.vertices || counts.edges != summary.edges {
            return Err(StoreError::Corrupt(format!(
                "store holds {} vertices and {} edges after generation, expected {} and {}",
                counts.vertices, counts.edges, summary.vertices, summary.edges
            )));
        }
        info!(
            vertices = summary.vertices,
            edges = summary.edges,
            seed = summary.seed,
            "synthetic graph generated"
        );
        Ok(summary)
    }
}
