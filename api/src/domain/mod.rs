pub mod queue_items;
pub mod users;
pub mod workflow_runs;
