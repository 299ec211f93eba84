//! OCPP Operation Payloads
//!
//! A representative set of request/response payloads. Each request type
//! implements [`Action`] so it can be sent with `Adapter::call` and served with
//! `Adapter::on`; further operations only need a struct pair and an impl.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Action;

/// Boot Notification Request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

/// Boot Notification Response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub status: RegistrationStatus,
    pub current_time: DateTime<Utc>,
    pub interval: i32, // Heartbeat interval in seconds
}

impl Action for BootNotificationRequest {
    const NAME: &'static str = "BootNotification";
    type Response = BootNotificationResponse;
}

/// Registration Status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// Heartbeat Request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

/// Heartbeat Response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

impl Action for HeartbeatRequest {
    const NAME: &'static str = "Heartbeat";
    type Response = HeartbeatResponse;
}

/// Reset Request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: ResetKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResetKind {
    Immediate,
    OnIdle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub status: GenericStatus,
}

impl Action for ResetRequest {
    const NAME: &'static str = "Reset";
    type Response = ResetResponse;
}

/// Accepted/Rejected answer shared by several operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GenericStatus {
    Accepted,
    Rejected,
}

/// Remote Start Transaction Request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStartTransactionRequest {
    pub id_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_profile: Option<ChargingProfile>,
}

/// Remote Start Transaction Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStartTransactionResponse {
    pub status: GenericStatus,
}

impl Action for RemoteStartTransactionRequest {
    const NAME: &'static str = "RemoteStartTransaction";
    type Response = RemoteStartTransactionResponse;
}

/// Set Charging Profile Request. The schedule is carried opaquely; composing
/// schedules is up to the receiving station.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChargingProfileRequest {
    pub connector_id: i32,
    #[serde(rename = "csChargingProfiles")]
    pub charging_profile: ChargingProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetChargingProfileResponse {
    pub status: GenericStatus,
}

impl Action for SetChargingProfileRequest {
    const NAME: &'static str = "SetChargingProfile";
    type Response = SetChargingProfileResponse;
}

/// Charging Profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingProfile {
    pub charging_profile_id: i32,
    pub stack_level: i32,
    pub charging_profile_purpose: ChargingProfilePurpose,
    pub charging_profile_kind: ChargingProfileKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    pub charging_schedule: ChargingSchedule,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChargingProfilePurpose {
    ChargePointMaxProfile,
    TxDefaultProfile,
    TxProfile,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChargingProfileKind {
    Absolute,
    Recurring,
    Relative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedule {
    pub charging_rate_unit: ChargingRateUnit,
    pub charging_schedule_period: Vec<ChargingSchedulePeriod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_schedule: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChargingRateUnit {
    W,
    A,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedulePeriod {
    pub start_period: i32, // Seconds from start of schedule
    pub limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<i32>,
}

/// Change Configuration Request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeConfigurationRequest {
    pub key: String,
    pub value: String,
}

/// Change Configuration Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeConfigurationResponse {
    pub status: ConfigurationStatus,
}

impl Action for ChangeConfigurationRequest {
    const NAME: &'static str = "ChangeConfiguration";
    type Response = ChangeConfigurationResponse;
}

/// Configuration Status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigurationStatus {
    Accepted,
    Rejected,
    RebootRequired,
    NotSupported,
}
