// Integration tests for instance group scaling against the mock provider

mod common;

use common::{mock_provider, ready_group, ZONE};
use fleeting_orchestrator::ErrorKind;
use fleeting_providers::mock::MockOp;
use fleeting_providers::{CallContext, IpFamily, ProviderError};

fn rejected(message: &str) -> ProviderError {
    ProviderError::Api {
        status: 400,
        message: message.to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_increase_creates_running_instances() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    let ctx = CallContext::background();

    let (ids, res) = group.increase(&ctx, 3).await;
    assert!(res.is_ok(), "unexpected errors: {:?}", res);
    assert_eq!(ids.len(), 3);

    let servers = mock.servers();
    assert_eq!(servers.len(), 3);
    for server in &servers {
        assert_eq!(server.state.as_str(), "running");
        assert!(ids.contains(&format!("{}:{}", server.name, server.id)));
        assert_eq!(mock.user_data(&server.id, "cloud-init").as_deref(), Some("#cloud-config\n"));
    }
    // One IPv4 and one IPv6 address per instance, all attached.
    assert_eq!(mock.ips().len(), 6);
    assert!(mock.ips().iter().all(|ip| ip.server_id.is_some()));
}

#[tokio::test]
async fn test_increase_by_zero_is_a_no_op() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    let before = mock.calls().len();

    let (ids, res) = group.increase(&CallContext::background(), 0).await;
    assert!(ids.is_empty());
    assert!(res.is_ok());
    assert_eq!(mock.calls().len(), before);
}

#[tokio::test(start_paused = true)]
async fn test_partial_batch_rolls_back_failed_instance() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    mock.fail_on(MockOp::CreateServer, "runner-a", rejected("quota exceeded"));

    let (ids, res) = group.increase(&CallContext::background(), 2).await;
    assert_eq!(ids.len(), 1);
    assert!(ids[0].starts_with("runner-b:"));

    let errs = res.unwrap_err();
    assert_eq!(errs.len(), 1);
    assert!(errs.contains(ErrorKind::Provider));
    assert!(errs.to_string().contains("quota exceeded"));

    // The addresses allocated for runner-a were released during rollback.
    assert_eq!(mock.calls_for(MockOp::DeleteIp).len(), 2);
    let remaining = mock.ips();
    assert_eq!(remaining.len(), 2);
    assert!(remaining
        .iter()
        .all(|ip| ip.tags.contains(&"instance=runner-b".to_string())));
    assert_eq!(mock.servers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_power_on_removes_the_server() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    mock.fail_next(MockOp::ServerAction, rejected("server locked"));

    let (ids, res) = group.increase(&CallContext::background(), 1).await;
    assert!(ids.is_empty());
    assert!(res.unwrap_err().contains(ErrorKind::Provider));

    assert_eq!(mock.calls_for(MockOp::DeleteServer).len(), 1);
    assert!(mock.servers().is_empty());
    assert!(mock.ips().is_empty());
    assert!(mock.volumes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_wait_rolls_back_instance() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    // The first server read happens while waiting for it to run.
    mock.fail_next(MockOp::GetServer, rejected("server state unavailable"));

    let (ids, res) = group.increase(&CallContext::background(), 1).await;
    assert!(ids.is_empty());
    let errs = res.unwrap_err();
    assert_eq!(errs.len(), 1);
    assert!(errs.contains(ErrorKind::WaitFailed));
    assert!(errs.to_string().contains("server state unavailable"));

    assert_eq!(mock.calls_for(MockOp::DeleteServer).len(), 1);
    assert!(mock.servers().is_empty());
    assert!(mock.ips().is_empty());
    assert!(mock.volumes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rollback_errors_are_reported_and_siblings_cleaned() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS", "PRO2-S"]).await;
    mock.set_out_of_stock("PRO2-XS");
    mock.set_out_of_stock("PRO2-S");
    // Nothing deletes addresses before rollback starts.
    mock.fail_next(MockOp::DeleteIp, rejected("ip locked"));

    let (ids, res) = group.increase(&CallContext::background(), 2).await;
    assert!(ids.is_empty());
    let errs = res.unwrap_err();
    assert_eq!(errs.len(), 3);
    assert_eq!(
        errs.iter().filter(|e| e.kind() == ErrorKind::CapacityExhausted).count(),
        2
    );
    assert!(errs.contains(ErrorKind::Provider));
    assert!(errs.to_string().contains("ip locked"));

    // One instance kept its addresses, the other was fully released.
    assert_eq!(mock.calls_for(MockOp::DeleteIp).len(), 3);
    let remaining = mock.ips();
    assert_eq!(remaining.len(), 2);
    let owner = remaining[0]
        .tags
        .iter()
        .find(|t| t.starts_with("instance="))
        .cloned()
        .expect("instance tag");
    assert!(remaining.iter().all(|ip| ip.tags.contains(&owner)));
}

#[tokio::test(start_paused = true)]
async fn test_out_of_stock_falls_back_to_next_type() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS", "PRO2-S"]).await;
    mock.set_out_of_stock("PRO2-XS");

    let (ids, res) = group.increase(&CallContext::background(), 1).await;
    assert!(res.is_ok());
    assert_eq!(ids.len(), 1);
    assert_eq!(mock.calls_for(MockOp::CreateServer), vec!["runner-a", "runner-a"]);
    assert_eq!(mock.servers()[0].commercial_type, "PRO2-S");
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_types_create_nothing() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS", "PRO2-S"]).await;
    mock.set_out_of_stock("PRO2-XS");
    mock.set_out_of_stock("PRO2-S");

    let (ids, res) = group.increase(&CallContext::background(), 2).await;
    assert!(ids.is_empty());
    let errs = res.unwrap_err();
    assert_eq!(errs.len(), 2);
    assert!(errs.iter().all(|e| e.kind() == ErrorKind::CapacityExhausted));
    assert!(errs.to_string().contains("PRO2-XS, PRO2-S"));

    assert!(mock.servers().is_empty());
    assert!(mock.ips().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_increase_still_rolls_back() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    let (ctx, cancel) = CallContext::background().with_cancel();
    cancel.cancel();

    let (ids, res) = group.increase(&ctx, 2).await;
    assert!(ids.is_empty());
    assert_eq!(res.unwrap_err().len(), 2);

    // Rollback runs on a detached context and still reaches the provider.
    assert_eq!(mock.calls_for(MockOp::ListIps).len(), 2);
    assert!(mock.calls_for(MockOp::CreateServer).is_empty());
    assert!(mock.ips().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_decrease_removes_every_resource() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    let ctx = CallContext::background();
    let (ids, res) = group.increase(&ctx, 2).await;
    assert!(res.is_ok());

    let (deleted, res) = group.decrease(&ctx, &ids).await;
    assert!(res.is_ok(), "unexpected errors: {:?}", res);
    assert_eq!(deleted, ids);
    assert!(mock.servers().is_empty());
    assert!(mock.ips().is_empty());
    assert!(mock.volumes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_decrease_of_deleted_instance_succeeds() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    let ctx = CallContext::background();
    let (ids, _) = group.increase(&ctx, 1).await;

    let (first, res) = group.decrease(&ctx, &ids).await;
    assert!(res.is_ok());
    assert_eq!(first, ids);

    let (second, res) = group.decrease(&ctx, &ids).await;
    assert!(res.is_ok());
    assert_eq!(second, ids);
    assert_eq!(mock.calls_for(MockOp::DeleteServer).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_decrease_skips_malformed_identifiers() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    let ids = vec!["garbage".to_string(), "runner-x:mock-missing".to_string()];

    let (deleted, res) = group.decrease(&CallContext::background(), &ids).await;
    assert_eq!(deleted, vec!["runner-x:mock-missing"]);
    let errs = res.unwrap_err();
    assert_eq!(errs.len(), 1);
    assert!(errs.contains(ErrorKind::InvalidIid));
    assert_eq!(mock.calls_for(MockOp::GetServer), vec!["mock-missing"]);
}

#[tokio::test(start_paused = true)]
async fn test_decrease_rejects_identifier_without_server_id() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    let ctx = CallContext::background();
    let (ids, res) = group.increase(&ctx, 1).await;
    assert!(res.is_ok());

    let (deleted, res) = group.decrease(&ctx, &["runner-a:".to_string()]).await;
    assert!(deleted.is_empty());
    assert!(res.unwrap_err().contains(ErrorKind::InvalidIid));

    // The live instance keeps everything it owns.
    assert!(mock.calls_for(MockOp::DeleteIp).is_empty());
    assert_eq!(mock.ips().len(), 2);
    assert_eq!(mock.servers().len(), 1);
    assert_eq!(group.list(&ctx).await.map(|l| l.len()).ok(), Some(ids.len()));
}

#[tokio::test(start_paused = true)]
async fn test_list_only_returns_group_instances() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    let ctx = CallContext::background();
    mock.seed_server("other-a", &["instance-group=other".to_string()]);
    let (ids, _) = group.increase(&ctx, 1).await;

    let instances = assert_ok(group.list(&ctx).await);
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].iid().to_string(), ids[0]);
}

#[tokio::test(start_paused = true)]
async fn test_get_returns_server_details() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    let ctx = CallContext::background();
    let (ids, _) = group.increase(&ctx, 1).await;

    let instance = assert_ok(group.get(&ctx, &ids[0]).await);
    let server = instance.server.expect("server details");
    assert_eq!(server.zone, ZONE);
    assert!(server.public_address(IpFamily::V4).is_some());

    let err = group.get(&ctx, "no-separator").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidIid);
}

#[tokio::test]
async fn test_sanity_only_logs_findings() {
    let mock = mock_provider();
    let group = ready_group(&mock, &["PRO2-XS"]).await;
    mock.seed_ip(
        IpFamily::V4,
        &["instance-group=ci".to_string(), "instance=runner-z".to_string()],
    );

    assert!(group.sanity(&CallContext::background()).await.is_ok());
    // Findings are reported, never repaired.
    assert_eq!(mock.ips().len(), 1);
}

fn assert_ok<T, E: std::fmt::Debug>(res: Result<T, E>) -> T {
    match res {
        Ok(v) => v,
        Err(e) => panic!("unexpected error: {:?}", e),
    }
}
