//! CLI commands

use std::sync::Arc;

use clap::{Args, ValueEnum};
use tokio_util::sync::CancellationToken;

use kiln_cluster::{ClusterController, ProviderConnector};
use kiln_common::config::RuntimeConfig;
use kiln_common::storage::{LocalStore, Storage};
use kiln_common::{CloudProvider, ClusterKey, ClusterType};
use kiln_remote::SshExecutorFactory;

use crate::Result;

pub mod create;
pub mod credentials;
pub mod delete;
pub mod get;
pub mod kubeconfig;
pub mod transfer;
pub mod workers;

/// Everything a command needs to reach the store and the providers
pub struct Context {
    pub controller: ClusterController,
}

impl Context {
    /// Local store, provider clients and SSH engine for one invocation
    pub fn new(runtime: &RuntimeConfig, cancel: CancellationToken) -> Result<Self> {
        let store: Arc<dyn Storage> = match &runtime.state_dir {
            Some(dir) => Arc::new(LocalStore::new(dir)),
            None => Arc::new(LocalStore::in_home()?),
        };
        let timing = runtime.timing();
        let executors =
            SshExecutorFactory::new(timing, runtime.fake).with_cancel(cancel.clone());
        let controller = ClusterController::new(
            store,
            Arc::new(ProviderConnector::new(runtime.fake)),
            Arc::new(executors),
            timing,
        )
        .with_cancel(cancel);
        Ok(Self { controller })
    }
}

/// Identifies one cluster
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Cloud provider (civo, aws, azure, local)
    #[arg(long)]
    pub provider: CloudProvider,

    /// Cluster name
    #[arg(long)]
    pub name: String,

    /// Provider region
    #[arg(long)]
    pub region: String,
}

impl ClusterArgs {
    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(self.provider, ClusterType::Ha, &self.name, &self.region)
    }
}

/// Output format
#[derive(Clone, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    /// Columnar table (default)
    #[default]
    Table,
    /// JSON
    Json,
}

/// Print rows as a column-aligned table with headers.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = w))
            .collect();
        format!("{}\n", padded.join("  ").trim_end())
    };

    let mut out = line(headers.to_vec());
    for row in rows {
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_columns_align_to_the_widest_cell() {
        let rows = vec![
            vec!["demo".to_string(), "local".to_string()],
            vec!["production".to_string(), "LON1".to_string()],
        ];
        let out = render_table(&["NAME", "REGION"], &rows);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "NAME        REGION");
        assert_eq!(lines[1], "demo        local");
        assert_eq!(lines[2], "production  LON1");
    }
}
