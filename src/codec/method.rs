//! Method-code tables shared by all three wire dialects (§4.1, §6).
//!
//! Codes are fixed by the protocol; this module exists so call sites say
//! `method::GET_STATUS` instead of a bare magic number.

pub const GET_ATTRIBUTES: i64 = 1;
pub const GET_STATUS: i64 = 1002;
pub const GET_FILE_DETAIL: i64 = 1046;

pub const START_PRINT: i64 = 128;
pub const PAUSE_PRINT: i64 = 129;
pub const RESUME_PRINT: i64 = 130;
pub const STOP_PRINT: i64 = 131;

pub const SET_NOZZLE_TEMP: i64 = 403;
pub const SET_BED_TEMP: i64 = 404;
pub const SET_FAN_SPEED: i64 = 405;
pub const SET_LIGHT: i64 = 403 + 100; // distinct code namespace, peripheral control
pub const SET_PRINT_SPEED_MODE: i64 = 401;

pub const ENABLE_VIDEO_STREAM: i64 = 386;
pub const LIST_FILES: i64 = 258;
pub const GET_DISK_INFO: i64 = 259;
pub const GET_CANVAS_STATUS: i64 = 650;

/// Inbound status-event push method, used by both CC2-MQTT and WS-SDCP.
pub const STATUS_EVENT: i64 = 6000;
