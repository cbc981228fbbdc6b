// 群聊客户端集成测试 - 进程内后端 + 进程内网关
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;

use farmhub_chat_core::metrics::drop_reason;
use farmhub_chat_core::{
    DeliveryState, GroupId, GroupStatus, HubChatConfig, HubChatError, HubClient, LocalSocketGateway,
    MemoryHubApi, Message, SessionIdentity, TimelineStatus, TimelineView, Topic, VerificationBadge,
};

const WAIT: Duration = Duration::from_secs(2);

fn asha() -> SessionIdentity {
    SessionIdentity::new("u1", "Asha", VerificationBadge::None)
}

fn ravi() -> SessionIdentity {
    SessionIdentity::new("u2", "Ravi", VerificationBadge::Verified)
}

fn stored(group: &GroupId, sender: &str, content: &str, at: &str) -> Message {
    Message {
        message_id: None,
        client_msg_id: None,
        group_id: group.clone(),
        sender_id: sender.to_string(),
        sender_name: sender.to_string(),
        sender_verified: false,
        content: content.to_string(),
        created_at: at.parse::<DateTime<Utc>>().unwrap(),
    }
}

async fn start(
    identity: SessionIdentity,
    api: &MemoryHubApi,
    gateway: &LocalSocketGateway,
) -> Result<HubClient> {
    let _ = tracing_subscriber::fmt::try_init();
    let client = HubClient::start(
        &HubChatConfig::default(),
        identity,
        Arc::new(api.clone()),
        Arc::new(gateway.clone()),
    )
    .await?;
    Ok(client)
}

async fn wait_view<F>(client: &HubClient, predicate: F) -> TimelineView
where
    F: FnMut(&TimelineView) -> bool,
{
    tokio::time::timeout(WAIT, client.wait_for_timeline(predicate))
        .await
        .expect("timed out waiting for timeline")
        .expect("client closed")
}

async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_history_is_shown_in_chronological_order() -> Result<()> {
    let api = MemoryHubApi::new();
    let group = api.add_group("g1", "Paddy growers");
    api.insert_message(stored(&group, "b", "third", "2025-05-01T10:03:00Z"));
    api.insert_message(stored(&group, "a", "first", "2025-05-01T10:01:00Z"));
    api.insert_message(stored(&group, "b", "second", "2025-05-01T10:02:00Z"));
    let gateway = LocalSocketGateway::new(64);

    let client = start(asha(), &api, &gateway).await?;
    let view = wait_view(&client, |v| v.is_ready()).await;

    assert_eq!(view.group_id, Some(group));
    assert!(view.live);
    assert_eq!(view.contents(), vec!["first", "second", "third"]);
    assert!(view.entries.iter().all(|e| e.state == DeliveryState::Confirmed));

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_sent_message_appears_once_for_sender_and_peer() -> Result<()> {
    let api = MemoryHubApi::new();
    let group = api.add_group("g1", "Paddy growers");
    let gateway = LocalSocketGateway::new(64);

    let sender = start(asha(), &api, &gateway).await?;
    let peer = start(ravi(), &api, &gateway).await?;
    wait_view(&sender, |v| v.is_ready() && v.live).await;
    wait_view(&peer, |v| v.is_ready() && v.live).await;

    let receipt = sender.send("  hello ").await?;
    assert!(receipt.broadcast);
    assert!(receipt.message_id.is_some());

    // 回显与持久化记录都到达后仍只有一个条目
    eventually(|| sender.metrics().live_events_received.get() == 1).await;
    let view = wait_view(&sender, |v| v.entries.len() == 1 && v.pending_count() == 0).await;
    assert_eq!(view.contents(), vec!["hello"]);
    assert_eq!(view.entries[0].message.message_id, receipt.message_id);

    let view = wait_view(&peer, |v| v.entries.len() == 1).await;
    assert_eq!(view.contents(), vec!["hello"]);
    assert_eq!(view.entries[0].message.sender_id, "u1");
    assert_eq!(api.stored_messages(&group).len(), 1);

    sender.shutdown().await?;
    peer.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_late_history_for_previous_group_is_discarded() -> Result<()> {
    let api = MemoryHubApi::new();
    let first = api.add_group("g", "Maize");
    let second = api.add_group("h", "Dairy");
    api.insert_message(stored(&first, "a", "maize news", "2025-05-01T09:00:00Z"));
    api.insert_message(stored(&second, "b", "dairy news", "2025-05-01T09:30:00Z"));
    api.hold_history(&first);
    let gateway = LocalSocketGateway::new(64);

    // 启动时自动选中 g，其历史被扣住
    let client = start(asha(), &api, &gateway).await?;
    wait_view(&client, |v| {
        v.group_id.as_ref() == Some(&first) && v.status == TimelineStatus::Loading
    })
    .await;

    client.set_active_group(Some(second.clone())).await?;
    let view = wait_view(&client, |v| v.is_ready()).await;
    assert_eq!(view.contents(), vec!["dairy news"]);

    api.release_history(&first);
    eventually(|| client.metrics().stale_history_discarded.get() == 1).await;

    let view = client.timeline();
    assert_eq!(view.group_id, Some(second));
    assert_eq!(view.contents(), vec!["dairy news"]);
    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_messages_for_other_groups_never_reach_the_timeline() -> Result<()> {
    let api = MemoryHubApi::new();
    let first = api.add_group("g1", "Paddy growers");
    let second = api.add_group("g2", "Orchards");
    let gateway = LocalSocketGateway::new(64);

    let viewer = start(asha(), &api, &gateway).await?;
    let other = start(ravi(), &api, &gateway).await?;
    wait_view(&viewer, |v| v.is_ready() && v.live).await;
    other.set_active_group(Some(second.clone())).await?;
    wait_view(&other, |v| v.is_ready() && v.live).await;

    other.send("only in orchards").await?;
    wait_view(&other, |v| v.entries.len() == 1).await;

    // 频道正确但载荷声明了其他群组
    let delivered = gateway
        .inject(
            &Topic::for_group("group", &first),
            json!({
                "type": "new-group-message", "group_id": "g2", "sender_id": "u9",
                "sender_name": "Mallika", "content": "mislabelled",
                "created_at": "2025-05-01T10:00:00Z"
            }),
        )
        .await;
    assert_eq!(delivered, 1);
    eventually(|| {
        viewer
            .metrics()
            .live_events_dropped
            .with_label_values(&[drop_reason::INACTIVE_GROUP])
            .get()
            == 1
    })
    .await;

    assert!(viewer.timeline().entries.is_empty());
    assert_eq!(api.stored_messages(&second).len(), 1);
    viewer.shutdown().await?;
    other.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_switching_groups_keeps_a_single_subscription() -> Result<()> {
    let api = MemoryHubApi::new();
    let first = api.add_group("g1", "Paddy growers");
    let second = api.add_group("g2", "Orchards");
    let gateway = LocalSocketGateway::new(64);

    let client = start(asha(), &api, &gateway).await?;
    wait_view(&client, |v| v.is_ready()).await;
    assert_eq!(gateway.topics_for_user("u1"), vec!["group:g1"]);

    client.set_active_group(Some(second)).await?;
    assert_eq!(gateway.topics_for_user("u1"), vec!["group:g2"]);
    client.set_active_group(Some(first)).await?;
    assert_eq!(gateway.topics_for_user("u1"), vec!["group:g1"]);

    let view = client.set_active_group(None).await?;
    assert_eq!(view.status, TimelineStatus::Idle);
    assert!(gateway.topics_for_user("u1").is_empty());

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_switch_proceeds_when_unsubscribe_fails() -> Result<()> {
    let api = MemoryHubApi::new();
    let first = api.add_group("g1", "Paddy growers");
    let second = api.add_group("g2", "Orchards");
    let gateway = LocalSocketGateway::new(64);

    let client = start(asha(), &api, &gateway).await?;
    wait_view(&client, |v| v.is_ready() && v.live).await;

    gateway.set_fail_unsubscribe(true);
    client.set_active_group(Some(second.clone())).await?;
    let view = wait_view(&client, |v| v.is_ready() && v.live).await;
    assert_eq!(view.group_id, Some(second));
    assert!(view.entries.is_empty());

    // 旧频道在网关侧仍然存在，其事件必须被丢弃
    let delivered = gateway
        .inject(
            &Topic::for_group("group", &first),
            json!({
                "type": "new-group-message", "group_id": "g1", "sender_id": "u9",
                "sender_name": "Mallika", "content": "still on the old channel",
                "created_at": "2025-05-01T10:00:00Z"
            }),
        )
        .await;
    assert_eq!(delivered, 1);
    eventually(|| {
        client
            .metrics()
            .live_events_dropped
            .with_label_values(&[drop_reason::INACTIVE_GROUP])
            .get()
            == 1
    })
    .await;
    assert!(client.timeline().entries.is_empty());

    gateway.set_fail_unsubscribe(false);
    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_reconnect_resubscribes_and_refetches_history() -> Result<()> {
    let api = MemoryHubApi::new();
    let group = api.add_group("g1", "Paddy growers");
    let gateway = LocalSocketGateway::new(64);

    let client = start(asha(), &api, &gateway).await?;
    wait_view(&client, |v| v.is_ready() && v.live).await;
    let requests_before = api.history_requests();

    // 断线期间写入的消息通过补拉历史获得
    gateway.interrupt().await;
    wait_view(&client, |v| !v.live).await;
    api.insert_message(stored(&group, "b", "while offline", "2025-05-01T10:00:00Z"));
    gateway.restore().await;

    let view = wait_view(&client, |v| v.live && v.entries.len() == 1).await;
    assert_eq!(view.contents(), vec!["while offline"]);
    assert!(api.history_requests() > requests_before);
    assert_eq!(gateway.topics_for_user("u1"), vec!["group:g1"]);

    gateway
        .inject(
            &Topic::for_group("group", &group),
            json!({
                "type": "new-group-message", "id": 77, "group_id": "g1", "sender_id": "u9",
                "sender_name": "Mallika", "content": "back online",
                "created_at": "2025-05-01T10:05:00Z"
            }),
        )
        .await;
    let view = wait_view(&client, |v| v.entries.len() == 2).await;
    assert_eq!(view.contents(), vec!["while offline", "back online"]);

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_send_stays_pending_with_error() -> Result<()> {
    let api = MemoryHubApi::new();
    let group = api.add_group("g1", "Paddy growers");
    let gateway = LocalSocketGateway::new(64);

    let client = start(asha(), &api, &gateway).await?;
    wait_view(&client, |v| v.is_ready()).await;
    api.fail_posts(true);
    gateway.set_fail_publish(true);

    let result = client.send("will it arrive").await;
    assert!(matches!(result, Err(HubChatError::Api { status: 500, .. })));

    let view = client.timeline();
    assert_eq!(view.entries.len(), 1);
    assert_eq!(view.entries[0].state, DeliveryState::Pending);
    assert!(view.entries[0].send_error.is_some());
    assert!(api.stored_messages(&group).is_empty());
    assert_eq!(client.metrics().send_failures.get(), 1);
    assert_eq!(client.metrics().broadcast_failures.get(), 1);

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_bare_persist_ack_waits_for_echo() -> Result<()> {
    let api = MemoryHubApi::new();
    let group = api.add_group("g1", "Paddy growers");
    api.bare_post_ack(true);
    let gateway = LocalSocketGateway::new(64);

    let client = start(asha(), &api, &gateway).await?;
    wait_view(&client, |v| v.is_ready() && v.live).await;
    gateway.set_fail_publish(true);

    let receipt = client.send("hello").await?;
    assert!(receipt.message_id.is_none());
    assert!(!receipt.broadcast);
    assert_eq!(api.stored_messages(&group).len(), 1);

    // 后端已存储但未返回记录，条目仍待确认
    let view = client.timeline();
    assert_eq!(view.entries.len(), 1);
    assert_eq!(view.entries[0].state, DeliveryState::Pending);
    assert!(view.entries[0].send_error.is_none());

    gateway
        .inject(
            &Topic::for_group("group", &group),
            json!({
                "type": "new-group-message", "client_msg_id": receipt.client_msg_id,
                "group_id": "g1", "sender_id": "u1", "sender_name": "Asha",
                "content": "hello", "created_at": Utc::now().to_rfc3339()
            }),
        )
        .await;
    let view = wait_view(&client, |v| v.pending_count() == 0).await;
    assert_eq!(view.entries.len(), 1);
    assert_eq!(view.entries[0].state, DeliveryState::Confirmed);

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_send_validation() -> Result<()> {
    let api = MemoryHubApi::new();
    let gateway = LocalSocketGateway::new(64);

    // 没有任何群组时不会自动选中
    let client = start(asha(), &api, &gateway).await?;
    assert!(matches!(client.send("hi").await, Err(HubChatError::NoActiveGroup)));

    api.add_group("g1", "Paddy growers");
    client.refresh_groups().await?;
    wait_view(&client, |v| v.is_ready()).await;
    assert!(matches!(client.send("  \n ").await, Err(HubChatError::EmptyContent)));
    assert!(client.timeline().entries.is_empty());
    assert_eq!(api.post_requests(), 0);

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_subscribe_failure_falls_back_to_history_only() -> Result<()> {
    let api = MemoryHubApi::new();
    let group = api.add_group("g1", "Paddy growers");
    api.insert_message(stored(&group, "b", "from history", "2025-05-01T10:00:00Z"));
    let gateway = LocalSocketGateway::new(64);
    gateway.set_fail_subscribe(true);

    let client = start(asha(), &api, &gateway).await?;
    let view = wait_view(&client, |v| v.is_ready()).await;
    assert!(!view.live);
    assert_eq!(view.contents(), vec!["from history"]);
    assert_eq!(client.metrics().subscribe_failures.get(), 1);

    // 重新进入群组时重试订阅
    gateway.set_fail_subscribe(false);
    client.set_active_group(Some(group)).await?;
    let view = wait_view(&client, |v| v.is_ready() && v.live).await;
    assert_eq!(view.entries.len(), 1);

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_history_failure_is_retried_on_reentry() -> Result<()> {
    let api = MemoryHubApi::new();
    let group = api.add_group("g1", "Paddy growers");
    api.insert_message(stored(&group, "b", "from history", "2025-05-01T10:00:00Z"));
    api.fail_history(true);
    let gateway = LocalSocketGateway::new(64);

    let client = start(asha(), &api, &gateway).await?;
    let view = wait_view(&client, |v| {
        matches!(v.status, TimelineStatus::Unavailable { .. })
    })
    .await;
    assert!(view.entries.is_empty());

    api.fail_history(false);
    client.set_active_group(Some(group)).await?;
    let view = wait_view(&client, |v| v.is_ready()).await;
    assert_eq!(view.contents(), vec!["from history"]);

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_group_shows_empty_state() -> Result<()> {
    let api = MemoryHubApi::new();
    api.add_group("g1", "Paddy growers");
    let gateway = LocalSocketGateway::new(64);

    let client = start(asha(), &api, &gateway).await?;
    wait_view(&client, |v| v.is_ready()).await;

    let view = client.set_active_group(Some(GroupId::from("missing"))).await?;
    assert_eq!(
        view.status,
        TimelineStatus::UnknownGroup {
            group_id: GroupId::from("missing")
        }
    );
    assert!(view.entries.is_empty());
    assert!(gateway.topics_for_user("u1").is_empty());

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_created_group_is_visible_only_after_approval() -> Result<()> {
    let api = MemoryHubApi::new();
    api.add_group("g1", "Paddy growers");
    api.add_pending_group("p1", "Awaiting review");
    let gateway = LocalSocketGateway::new(64);

    let member = start(asha(), &api, &gateway).await?;
    let verified = start(ravi(), &api, &gateway).await?;
    let visible: Vec<String> = verified.groups().iter().map(|g| g.name.clone()).collect();
    assert_eq!(visible, vec!["Paddy growers"]);

    assert!(matches!(
        member.create_group("Soil health", "").await,
        Err(HubChatError::PermissionDenied(_))
    ));
    assert!(matches!(
        verified.create_group("   ", "").await,
        Err(HubChatError::InvalidInput(_))
    ));

    let created = verified.create_group(" Soil health ", "tips").await?;
    assert_eq!(created.status, GroupStatus::Pending);
    assert_eq!(created.name, "Soil health");
    let groups = verified.refresh_groups().await?;
    assert!(groups.iter().all(|g| g.id != created.id));

    let declined = verified.create_group("Pest alerts", "").await?;
    assert!(api.reject_group(&declined.id));
    assert!(!api.reject_group(&GroupId::from("missing")));

    api.approve_group(&created.id);
    let groups = member.refresh_groups().await?;
    assert!(groups.iter().any(|g| g.id == created.id));
    assert!(groups.iter().all(|g| g.id != declined.id));
    assert_eq!(member.groups().len(), 2);

    member.shutdown().await?;
    verified.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_releases_channel_and_connection() -> Result<()> {
    let api = MemoryHubApi::new();
    api.add_group("g1", "Paddy growers");
    let gateway = LocalSocketGateway::new(64);

    let client = start(asha(), &api, &gateway).await?;
    wait_view(&client, |v| v.is_ready()).await;
    assert_eq!(gateway.connection_count(), 1);

    client.shutdown().await?;
    assert!(gateway.topics_for_user("u1").is_empty());
    assert_eq!(gateway.connection_count(), 0);
    assert_eq!(client.timeline().status, TimelineStatus::Idle);
    assert!(matches!(client.send("late").await, Err(HubChatError::ClientClosed)));

    // 重复关闭是安全的
    client.shutdown().await?;
    Ok(())
}
