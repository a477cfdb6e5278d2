//! `jobforge trigger`: request a manual run from a running server.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use jobforge_config::JobForgeConfig;

/// Base URL of the admin API described by `config`, as seen from this host.
pub fn admin_base_url(config: &JobForgeConfig) -> String {
    let host = match config.admin.bind.as_str() {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" => "[::1]",
        other => other,
    };
    format!("http://{host}:{}", config.admin.port)
}

pub async fn run(config: &JobForgeConfig, job_id: &str, priority: Option<i32>) -> Result<()> {
    let url = format!("{}/api/jobs/{job_id}/run", admin_base_url(config));
    let body = match priority {
        Some(priority) => json!({ "priority": priority }),
        None => json!({}),
    };

    let resp = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("JobForge is not reachable at {url}"))?;
    let status = resp.status();
    let body: Value = resp.json().await.context("Unreadable response from admin API")?;

    if !status.is_success() {
        let message = body["message"].as_str().unwrap_or("request failed");
        bail!("{status}: {message}");
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_bind_is_reached_via_loopback() {
        let mut config = JobForgeConfig::default();
        config.admin.bind = "0.0.0.0".into();
        config.admin.port = 9001;
        assert_eq!(admin_base_url(&config), "http://127.0.0.1:9001");

        config.admin.bind = "10.0.0.5".into();
        assert_eq!(admin_base_url(&config), "http://10.0.0.5:9001");
    }
}
