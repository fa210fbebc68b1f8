//! loyalty-stress: concurrent claim load generator
//!
//! Seeds one user and one reward, fires N concurrent claims with distinct
//! idempotency keys against the configured store and reports how they
//! resolved. Exactly one claim should succeed.
//!
//! ## Configuration
//! - LOYALTY_CONFIG: config file path (default: config.yaml if present)
//! - LOYALTY_STRESS_CLAIMS: concurrent claims to fire (default: 100)
//! - LOYALTY_STRESS_BALANCE: starting balance (default: 5000)
//! - LOYALTY_STRESS_COST: reward cost (default: 100)

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Instant;

use futures::future::join_all;
use tracing::info;
use uuid::Uuid;

use loyalty::config::Config;
use loyalty::model::Reward;
use loyalty::storage::init_storage;
use loyalty::utils::bootstrap::init_tracing;
use loyalty::Services;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let claims: usize = env_or("LOYALTY_STRESS_CLAIMS", 100);
    let balance: i64 = env_or("LOYALTY_STRESS_BALANCE", 5000);
    let cost: i64 = env_or("LOYALTY_STRESS_COST", 100);

    let config = Config::load(None)?;
    info!(path = %config.storage.path, claims, balance, cost, "starting loyalty-stress");

    let store = init_storage(&config.storage).await?;
    let services = Services::new(store, config);

    let run = Uuid::new_v4().simple().to_string();
    let user_id = format!("stress-user-{}", run);
    let reward_id = format!("stress-reward-{}", run);
    services.rewards().create_user(&user_id).await?;
    services
        .rewards()
        .upsert_reward(Reward::new(&reward_id, "Stress reward", cost))
        .await?;
    services.points().add_points(&user_id, balance).await?;

    let started = Instant::now();
    let tasks = (0..claims).map(|_| {
        let claims = services.claims();
        let user_id = user_id.clone();
        let reward_id = reward_id.clone();
        tokio::spawn(async move {
            claims
                .claim(&user_id, &reward_id, &Uuid::new_v4().to_string())
                .await
        })
    });

    let mut outcomes: BTreeMap<String, usize> = BTreeMap::new();
    for reply in join_all(tasks).await {
        let reply = reply?;
        let code = reply
            .json()
            .ok()
            .and_then(|body| body.get("code").and_then(|c| c.as_str()).map(str::to_string))
            .unwrap_or_else(|| "SUCCESS".to_string());
        *outcomes.entry(format!("{} {}", reply.status, code)).or_default() += 1;
    }
    let elapsed = started.elapsed();

    let final_balance = services.points().get_balance(&user_id).await?;

    println!("claims fired:   {}", claims);
    println!("elapsed:        {:?}", elapsed);
    println!("outcomes:");
    for (outcome, count) in &outcomes {
        println!("  {:<32} {}", outcome, count);
    }
    println!(
        "final balance:  {} (expected {})",
        final_balance.points,
        balance - cost
    );
    println!(
        "metrics:        {}",
        serde_json::to_string_pretty(&services.metrics.snapshot())?
    );

    Ok(())
}
