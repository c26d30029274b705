//! Integration tests for utilization-driven scaling of a deployment.

use std::sync::Arc;
use std::time::Duration;

use ork_orchestrator::autoscale::{AutoscalePolicy, Decision, HoldReason, DEFAULT_SAMPLE_INTERVAL};
use ork_orchestrator::controller::ControllerSettings;
use ork_orchestrator::model::{Resources, WorkloadSpec};
use ork_orchestrator::signals::{self, SignalSender, UtilizationSample};
use ork_orchestrator::status::ConditionKind;
use ork_orchestrator::substrate::MockSubstrate;
use ork_orchestrator::{Cluster, ControllerError, ReplicaSetController};

fn api() -> WorkloadSpec {
    let size = Resources::new(200, 128 << 20);
    WorkloadSpec::new("api", "api:1", size, size).with_label("app", "api")
}

fn setup() -> (Arc<Cluster>, SignalSender) {
    let (tx, inbox) = signals::channel(1024, Duration::from_secs(600));
    let substrate = Arc::new(MockSubstrate::auto_ready(tx.clone()));
    let cluster = Cluster::new(
        Resources::new(8000, 8 << 30),
        substrate,
        inbox,
        ControllerSettings::default(),
    );
    (Arc::new(cluster), tx)
}

async fn report_utilization(tx: &SignalSender, deployment: &ReplicaSetController, ratio: f64) {
    for id in deployment.running_instances().await {
        tx.utilization(UtilizationSample::new(id, ratio)).unwrap();
    }
}

async fn settle(cluster: &Cluster) {
    cluster.reconcile_all().await;
    cluster.reconcile_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_scale_up_then_down_to_floor() {
    let (cluster, tx) = setup();
    let deployment = cluster.apply_deployment(api(), 2).await.unwrap();
    let policy = AutoscalePolicy::new(2, 5, 0.7).unwrap();
    cluster.apply_autoscaler("api-hpa", "api", policy).await.unwrap();
    settle(&cluster).await;
    assert_eq!(deployment.running_instances().await.len(), 2);

    // 2 replicas at 140% against a 70% target, held over two sample
    // intervals: ceil(2 * 1.4 / 0.7) = 4.
    report_utilization(&tx, &deployment, 1.4).await;
    tokio::time::advance(DEFAULT_SAMPLE_INTERVAL).await;
    report_utilization(&tx, &deployment, 1.4).await;
    let stats = cluster.autoscale_all().await;
    assert_eq!(stats.scaled, 1);
    assert_eq!(deployment.desired(), 4);

    settle(&cluster).await;
    assert_eq!(deployment.running_instances().await.len(), 4);

    // Let the hot samples age out, then report 10% everywhere.
    tokio::time::advance(Duration::from_secs(61)).await;
    report_utilization(&tx, &deployment, 0.1).await;

    // ceil(4 * 0.1 / 0.7) = 1, floored at 2, but the scale-up was recent.
    let scaler = cluster.autoscaler("api-hpa").await.unwrap();
    let decision = scaler.evaluate().await.unwrap();
    assert!(matches!(
        decision,
        Decision::Hold(HoldReason::Cooldown { proposed: 2, .. })
    ));
    assert_eq!(deployment.desired(), 4);

    tokio::time::advance(Duration::from_secs(300)).await;
    report_utilization(&tx, &deployment, 0.1).await;
    let decision = scaler.evaluate().await.unwrap();
    assert!(matches!(decision, Decision::Scale { from: 4, to: 2, .. }));
    assert_eq!(deployment.desired(), 2);

    cluster.reconcile_all().await;
    assert_eq!(deployment.running_instances().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_within_threshold_holds() {
    let (cluster, tx) = setup();
    let deployment = cluster.apply_deployment(api(), 3).await.unwrap();
    cluster
        .apply_autoscaler("api-hpa", "api", AutoscalePolicy::new(1, 10, 0.5).unwrap())
        .await
        .unwrap();
    settle(&cluster).await;

    report_utilization(&tx, &deployment, 0.52).await;
    let scaler = cluster.autoscaler("api-hpa").await.unwrap();
    assert!(matches!(
        scaler.evaluate().await.unwrap(),
        Decision::Hold(HoldReason::WithinThreshold { .. })
    ));
    assert_eq!(deployment.desired(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_missing_samples_freeze_desired_count() {
    let (cluster, _tx) = setup();
    let deployment = cluster.apply_deployment(api(), 3).await.unwrap();
    cluster
        .apply_autoscaler("api-hpa", "api", AutoscalePolicy::new(1, 10, 0.5).unwrap())
        .await
        .unwrap();
    settle(&cluster).await;

    let stats = cluster.autoscale_all().await;
    assert_eq!(stats.evaluated, 1);
    assert_eq!(stats.degraded, 1);
    assert_eq!(stats.scaled, 0);
    assert_eq!(deployment.desired(), 3);

    let status = deployment.status().await;
    assert!(status.has_condition(ConditionKind::DegradedMetrics));

    let scaler = cluster.autoscaler("api-hpa").await.unwrap();
    assert!(matches!(
        scaler.evaluate().await,
        Err(ControllerError::DegradedMetrics { desired: 3, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_stale_instances_are_excluded_not_zeroed() {
    let (cluster, tx) = setup();
    let deployment = cluster.apply_deployment(api(), 2).await.unwrap();
    cluster
        .apply_autoscaler("api-hpa", "api", AutoscalePolicy::new(1, 10, 0.5).unwrap())
        .await
        .unwrap();
    settle(&cluster).await;

    let running = deployment.running_instances().await;
    // Only one instance reports; the other must not drag the mean to 0.5.
    tx.utilization(UtilizationSample::new(running[0], 1.0)).unwrap();

    let scaler = cluster.autoscaler("api-hpa").await.unwrap();
    let decision = scaler.evaluate().await.unwrap();
    // ceil(2 * 1.0 / 0.5) = 4
    assert!(matches!(decision, Decision::Scale { from: 2, to: 4, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_attach_clamps_and_rejects_second_scaler() {
    let (cluster, _tx) = setup();
    let deployment = cluster.apply_deployment(api(), 12).await.unwrap();
    cluster
        .apply_autoscaler("api-hpa", "api", AutoscalePolicy::new(2, 5, 0.7).unwrap())
        .await
        .unwrap();
    assert_eq!(deployment.desired(), 5);

    // Re-applying the deployment stays inside the bounds.
    cluster.apply_deployment(api(), 1).await.unwrap();
    assert_eq!(deployment.desired(), 2);

    let err = cluster
        .apply_autoscaler("other", "api", AutoscalePolicy::new(1, 3, 0.5).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::InvalidPolicy(_)));

    let err = cluster
        .apply_autoscaler("ghost", "missing", AutoscalePolicy::new(1, 3, 0.5).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::UnknownWorkload(_)));
}
