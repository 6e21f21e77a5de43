use std::{collections::BTreeMap, sync::Arc, time::Duration};

use cyclebench::{
    Activity, ActivityConfig, OpRegistry, PollingPredicate, RateSpec, Reporter, RunReport,
    RunState, Status, StdoutReporter, TimeoutPredicate,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Stand-ins for real requests: reads are cheap, writes are slow and sometimes fail
    let mut registry = OpRegistry::new();
    registry
        .register_fn("read", |_, _| async {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(())
        })
        .register_fn("write", |cycle, _| async move {
            tokio::time::sleep(Duration::from_millis(8)).await;
            if cycle % 97 == 0 {
                return Err(format!("write {cycle} timed out").into());
            }
            Ok(())
        });

    let params: BTreeMap<String, String> = [
        ("alias", "throttled"),
        ("threads", "8"),
        ("cycles", "0..5K"),
        ("rate", "500,1.2"),
        ("ops", "read:4,write:1"),
        ("seq", "interleaved"),
        ("errors", "warn,store,count"),
        ("maxtries", "2"),
        ("shutdown", "2s"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let activity = Arc::new(Activity::new(ActivityConfig::from_params(&params)?, &registry)?);
    activity.start()?;

    // Wait until every motor is past startup
    let tally = activity.tally().clone();
    let threads = activity.threads() as i64;
    let mut ready = PollingPredicate::new(
        move || tally.snapshot(),
        TimeoutPredicate::new(
            move |image: &cyclebench::RunStateImage| Ok(image.count(RunState::Running) == threads),
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .named("motors running"),
    );
    let result = ready.converge().await?;
    if result.status != Status::Complete {
        activity.request_stop();
    }

    tokio::time::sleep(Duration::from_secs(3)).await;
    activity.update_rate_spec(RateSpec::new(1_500.0)?.with_burst(1.2)?)?;

    let summary = activity.join(None).await?;
    StdoutReporter.report(&RunReport::from(summary)).await
}
