//! The chart resource: model, persistence and commands.

pub mod commands;
pub mod model;
pub mod store;

pub use commands::{
    BulkDeleteChartCommand, ChartExport, Command, CommandContext, CreateChartCommand,
    DeleteChartCommand, ExportChartsCommand, FavoriteStatus, FavoriteStatusCommand,
    ImportChartsCommand, UpdateChartCommand,
};
pub use model::{Chart, ChartPost, ChartPut};
pub use store::{ChartStore, InMemoryChartStore};
