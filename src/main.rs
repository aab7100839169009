/// Entry point of the `stats-collect` binary.
///
/// Collects statistics on a SUT while running the workload given on the command line.
/// The SUT, the statistics and the output directory come from `STATS_COLLECT_*`
/// environment variables.
///
/// # Examples
///
/// ```bash
/// STATS_COLLECT_HOST=sut1 STATS_COLLECT_STATS=default,ipmi stats-collect ./benchmark.sh
/// ```
#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    stats_collect::run().await
}
