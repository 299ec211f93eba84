use anyhow::{Context, Result};
use chrono::Utc;
use ocpp_netcore::config::EngineConfig;
use ocpp_netcore::envelope::{EncryptionContext, KeyId, SecureOptions};
use ocpp_netcore::events::{EventFilter, EventKind};
use ocpp_netcore::ocpp::messages::{
    BootNotificationRequest, BootNotificationResponse, GenericStatus, HeartbeatRequest,
    HeartbeatResponse, RegistrationStatus, RemoteStartTransactionRequest,
    RemoteStartTransactionResponse, ResetKind, ResetRequest, ResetResponse,
};
use ocpp_netcore::transport::LoopbackNetwork;
use ocpp_netcore::{telemetry, Adapter, AdapterSettings, CallOptions, NodeId, SigningKey};
use std::time::Duration;
use tracing::{info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Runs a three-node topology in one process, `CSMS <-> NN01 <-> CS001`, and
/// exercises routed, signed and encrypted calls across it.
#[tokio::main]
async fn main() -> Result<()> {
    let cfg = EngineConfig::load()?;
    telemetry::init_tracing(&cfg.logging);

    let network = LoopbackNetwork::new();
    let csms_id = cfg.node.node_id()?;
    let nn01_id = NodeId::new("NN01")?;
    let cs001_id = NodeId::new("CS001")?;

    let (transport, events) = network.join(csms_id.clone());
    let csms = Adapter::from_config(&cfg, transport)?;
    csms.attach(events);

    let settings = AdapterSettings::from(&cfg);
    let (transport, events) = network.join(nn01_id.clone());
    let nn01 = Adapter::new(nn01_id.clone(), settings.clone(), transport);
    nn01.attach(events);

    let (transport, events) = network.join(cs001_id.clone());
    let cs001 = Adapter::new(cs001_id.clone(), settings, transport);
    cs001.attach(events);

    csms.router().add_route(cs001_id.clone(), nn01_id.clone());
    cs001.router().set_default_route(Some(nn01_id.clone()));

    let _traffic = csms.events().spawn_listener(
        EventFilter::only([EventKind::ResponseReceived, EventKind::Anomaly]),
        |event| info!(kind = %event.kind(), request_id = ?event.request_id(), "CSMS event"),
    );

    csms.on(|ctx, request: BootNotificationRequest| async move {
        info!(
            from = %ctx.origin,
            vendor = %request.charge_point_vendor,
            model = %request.charge_point_model,
            "Boot notification"
        );
        Ok(BootNotificationResponse {
            status: RegistrationStatus::Accepted,
            current_time: Utc::now(),
            interval: HEARTBEAT_INTERVAL.as_secs() as i32,
        })
    });
    csms.on(|ctx, _request: HeartbeatRequest| async move {
        info!(from = %ctx.origin, "Heartbeat");
        Ok(HeartbeatResponse {
            current_time: Utc::now(),
        })
    });
    cs001.on(|ctx, request: ResetRequest| async move {
        info!(kind = ?request.kind, signatures = ctx.signatures.len(), "Reset requested");
        for signature in &ctx.signatures {
            if let Err(e) = signature.verify(&serde_json::to_value(&request).unwrap_or_default()) {
                warn!(error = %e, "Rejecting reset with bad signature");
                return Ok(ResetResponse {
                    status: GenericStatus::Rejected,
                });
            }
        }
        Ok(ResetResponse {
            status: GenericStatus::Accepted,
        })
    });
    cs001.on(|_ctx, request: RemoteStartTransactionRequest| async move {
        info!(id_tag = %request.id_tag, connector = ?request.connector_id, "Remote start requested");
        Ok(RemoteStartTransactionResponse {
            status: GenericStatus::Accepted,
        })
    });
    cs001.on_secure_data(|origin, plaintext| async move {
        info!(origin = %origin, bytes = plaintext.len(), "Secure data received");
        Ok(())
    });

    let context = EncryptionContext::generate(KeyId::DEFAULT)?;
    csms.key_store().register_outbound(cs001_id.clone(), context.clone());
    cs001.key_store().register_inbound(csms_id.clone(), context);

    network.link(&csms_id, &nn01_id);
    network.link(&nn01_id, &cs001_id);
    wait_for_link(&csms, &nn01_id).await?;
    wait_for_link(&cs001, &nn01_id).await?;
    wait_for_link(&nn01, &cs001_id).await?;

    let boot = cs001
        .call(
            csms_id.clone(),
            BootNotificationRequest {
                charge_point_vendor: "Acme".to_string(),
                charge_point_model: "AC-22".to_string(),
                charge_point_serial_number: Some("SN-0001".to_string()),
                firmware_version: None,
            },
            CallOptions::default(),
        )
        .await?;
    info!(status = ?boot.status, interval = boot.interval, "Boot answered");
    let heartbeat_every = Duration::from_secs(boot.interval.max(1) as u64);

    let operator = SigningKey::generate()?.with_signer("operator");
    let reset = csms
        .call(
            cs001_id.clone(),
            ResetRequest {
                kind: ResetKind::OnIdle,
                evse_id: None,
            },
            CallOptions::default().signed_by(operator),
        )
        .await?;
    info!(status = ?reset.status, "Reset answered");

    let secure = csms
        .send_secure(
            cs001_id.clone(),
            b"{\"meterSerial\":\"MTR-0001\"}",
            SecureOptions::default(),
            CallOptions::default(),
        )
        .await?;
    info!(status = ?secure.status, "Secure data transfer answered");

    let started = csms
        .call(
            cs001_id.clone(),
            RemoteStartTransactionRequest {
                id_tag: "TAG-0001".to_string(),
                connector_id: Some(1),
                charging_profile: None,
            },
            CallOptions::default(),
        )
        .await?;
    info!(status = ?started.status, "Remote start answered");

    let heartbeat = heartbeat_loop(cs001.clone(), csms_id.clone(), heartbeat_every);
    tokio::select! {
        _ = telemetry::shutdown_signal() => {},
        result = heartbeat => result?,
    }

    for adapter in [&cs001, &nn01, &csms] {
        adapter.shutdown();
    }
    info!(stats = ?csms.stats(), "shutdown complete");
    Ok(())
}

async fn wait_for_link(adapter: &Adapter, peer: &NodeId) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !adapter.router().is_connected(peer) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("{} never connected to {}", adapter.local(), peer))
}

async fn heartbeat_loop(station: Adapter, csms: NodeId, every: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        match station
            .call(csms.clone(), HeartbeatRequest {}, CallOptions::default())
            .await
        {
            Ok(response) => info!(current_time = %response.current_time, "Heartbeat acknowledged"),
            Err(result) => warn!(result = %result, "Heartbeat failed"),
        }
    }
}
