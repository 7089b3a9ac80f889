use autorc::nodes::NodeRegistry;
use autorc::unit::run_unit;

/// Runs until the node is done; the caller exits with the returned code.
pub async fn execute() -> anyhow::Result<i32> {
    run_unit(NodeRegistry::builtin()).await
}
