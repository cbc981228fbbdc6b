//! # 群聊会话演示
//!
//! 两个成员连接到同一个进程内网关，在同一个群组中对话：
//! 发送方先看到待确认的乐观条目，回显与持久化结果到达后合并为一条已确认消息；
//! 另一个成员只通过实时频道收到消息。
//!
//! ```bash
//! cargo run --example hub_session
//!
//! # 指定配置文件与日志级别
//! RUST_LOG=farmhub_chat_core=debug cargo run --example hub_session -- config.toml
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use farmhub_chat_core::api::MemoryHubApi;
use farmhub_chat_core::config::{HubChatConfig, load_config};
use farmhub_chat_core::metrics::gather_metrics;
use farmhub_chat_core::tracing::init_tracing_from_config;
use farmhub_chat_core::{
    HubClient, Message, Result, SessionIdentity, TimelineView, VerificationBadge,
};
use farmhub_chat_core::transport::LocalSocketGateway;
use tracing::{info, warn};

fn print_timeline(who: &str, view: &TimelineView) {
    println!("--- {who} ({:?}, live: {}) ---", view.status, view.live);
    for entry in &view.entries {
        println!(
            "  [{}] {}{}: {} ({:?})",
            entry.message.created_at.format("%H:%M:%S"),
            entry.message.sender_name,
            if entry.message.sender_verified { " ✔" } else { "" },
            entry.message.content,
            entry.state,
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args().nth(1);
    let config = match load_config(path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config, using defaults: {e:#}");
            HubChatConfig::default()
        }
    };
    init_tracing_from_config(Some(&config.logging));

    // 进程内后端：一个已审核群组带两条历史消息，另有一个待审核群组
    let api = MemoryHubApi::new();
    let group = api.add_group("1", "Paddy growers");
    api.add_pending_group("2", "Unreviewed cooperative");
    let now = Utc::now();
    for (offset, sender, content) in [
        (120, "Mallika", "Monsoon arrived early in the delta"),
        (60, "Ravi", "Transplanting starts next week"),
    ] {
        api.insert_message(Message {
            message_id: None,
            client_msg_id: None,
            group_id: group.clone(),
            sender_id: sender.to_lowercase(),
            sender_name: sender.to_string(),
            sender_verified: sender == "Ravi",
            content: content.to_string(),
            created_at: now - Duration::seconds(offset),
        });
    }
    let gateway = LocalSocketGateway::new(config.gateway.event_buffer);

    let asha = HubClient::start(
        &config,
        SessionIdentity::new("asha", "Asha", VerificationBadge::None),
        Arc::new(api.clone()),
        Arc::new(gateway.clone()),
    )
    .await?;
    let ravi = HubClient::start(
        &config,
        SessionIdentity::new("ravi", "Ravi", VerificationBadge::Verified),
        Arc::new(api.clone()),
        Arc::new(gateway.clone()),
    )
    .await?;

    asha.wait_for_timeline(|v| v.is_ready()).await?;
    ravi.wait_for_timeline(|v| v.is_ready()).await?;
    info!(groups = asha.groups().len(), "both members joined");
    print_timeline("asha", &asha.timeline());

    let receipt = asha.send("Anyone tried the new drought-tolerant seed?").await?;
    info!(client_msg_id = %receipt.client_msg_id, broadcast = receipt.broadcast, "message sent");
    ravi.send("Yes, germination was good on my plot").await?;

    asha.wait_for_timeline(|v| v.entries.len() == 4 && v.pending_count() == 0)
        .await?;
    ravi.wait_for_timeline(|v| v.entries.len() == 4 && v.pending_count() == 0)
        .await?;
    print_timeline("asha", &asha.timeline());
    print_timeline("ravi", &ravi.timeline());

    match ravi.create_group("Soil health", "Testing kits and results").await {
        Ok(group) => info!(group_id = %group.id, status = ?group.status, "group awaiting approval"),
        Err(e) => warn!(error = %e, "group creation failed"),
    }

    asha.shutdown().await?;
    ravi.shutdown().await?;
    println!("{}", gather_metrics());
    Ok(())
}
