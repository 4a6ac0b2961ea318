//! Per-kind body layouts.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, BytesMut};

use super::format::*;
use crate::error::{Cd11Error, DecodeError, Result};
use crate::gap_list::SequenceRange;
use crate::types::{
    Acknowledgment, Alert, ChannelDescription, ChannelSubframe, ConnectionRequest, ConnectionResponse,
    DataFrame, FRAMESET_LEN, FrameBody, FrameOption, FrameType, JulianTimestamp, ProtocolVersion,
    ServiceType, TIMESTAMP_LEN,
};

const NAME_LEN: usize = 8;
const TYPE_LEN: usize = 4;
const SERVICE_LEN: usize = 4;
const SITE_LEN: usize = 5;
const CHANNEL_LEN: usize = 3;
const LOCATION_LEN: usize = 2;
const DATA_TYPE_LEN: usize = 2;

/// Site, channel and location per channel in the data frame's channel string.
const CHANNEL_STRING_WIDTH: usize = SITE_LEN + CHANNEL_LEN + LOCATION_LEN;

/// Smallest channel subframe: every fixed field, empty status/data/auth.
const MIN_SUBFRAME_LEN: usize = 4 * 9 + 24 + TIMESTAMP_LEN;

/// Sequence value meaning "nothing received yet" in acknowledgments.
const NO_SEQUENCE: u64 = u64::MAX;

pub fn encode_body(body: &FrameBody, out: &mut BytesMut) -> Result<()> {
    match body {
        FrameBody::ConnectionRequest(req) => put_connection(
            out,
            req.version,
            &req.station_name,
            &req.station_type,
            req.service_type,
            req.endpoint,
            req.secondary,
        ),
        FrameBody::ConnectionResponse(resp) => put_connection(
            out,
            resp.version,
            &resp.responder_name,
            &resp.responder_type,
            resp.service_type,
            resp.endpoint,
            resp.secondary,
        ),
        FrameBody::OptionRequest(options) | FrameBody::OptionResponse(options) => {
            put_u32_len(out, options.len(), "option count")?;
            for option in options {
                out.put_u32(option.option_type);
                put_sized(out, &option.value, "option value")?;
            }
            Ok(())
        }
        FrameBody::Data(data) => put_data(out, data),
        FrameBody::Acknowledgment(ack) => {
            put_fixed_str(out, &ack.frameset_acked, FRAMESET_LEN, "frameset acked")?;
            out.put_u64(ack_sequence(ack.lowest_seq, "lowest sequence")?);
            out.put_u64(ack_sequence(ack.highest_seq, "highest sequence")?);
            put_u32_len(out, ack.gaps.len(), "gap count")?;
            for gap in &ack.gaps {
                out.put_u64(gap.start());
                out.put_u64(gap_end_exclusive(gap)?);
            }
            Ok(())
        }
        FrameBody::Alert(alert) => put_sized(out, alert.message.as_bytes(), "alert message"),
    }
}

pub fn decode_body(frame_type: FrameType, buf: &mut &[u8]) -> Result<FrameBody, DecodeError> {
    let body = match frame_type {
        FrameType::ConnectionRequest => {
            let c = get_connection(buf)?;
            FrameBody::ConnectionRequest(ConnectionRequest {
                version: c.version,
                station_name: c.name,
                station_type: c.kind,
                service_type: c.service_type,
                endpoint: c.endpoint,
                secondary: c.secondary,
            })
        }
        FrameType::ConnectionResponse => {
            let c = get_connection(buf)?;
            FrameBody::ConnectionResponse(ConnectionResponse {
                version: c.version,
                responder_name: c.name,
                responder_type: c.kind,
                service_type: c.service_type,
                endpoint: c.endpoint,
                secondary: c.secondary,
            })
        }
        FrameType::OptionRequest => FrameBody::OptionRequest(get_options(buf)?),
        FrameType::OptionResponse => FrameBody::OptionResponse(get_options(buf)?),
        FrameType::Data => FrameBody::Data(get_data(buf)?),
        FrameType::Acknowledgment => FrameBody::Acknowledgment(get_acknowledgment(buf)?),
        FrameType::Alert => {
            let message = get_sized(buf, "alert message")?;
            let message = String::from_utf8(message.to_vec())
                .map_err(|e| DecodeError::malformed("alert message", e.to_string()))?;
            FrameBody::Alert(Alert { message })
        }
    };
    expect_end(buf, "frame body")?;
    Ok(body)
}

fn put_connection(
    out: &mut BytesMut,
    version: ProtocolVersion,
    name: &str,
    kind: &str,
    service_type: ServiceType,
    endpoint: SocketAddrV4,
    secondary: Option<SocketAddrV4>,
) -> Result<()> {
    out.put_u16(version.major);
    out.put_u16(version.minor);
    put_fixed_str(out, name, NAME_LEN, "station name")?;
    put_fixed_str(out, kind, TYPE_LEN, "station type")?;
    put_fixed_str(out, service_type.as_str(), SERVICE_LEN, "service type")?;
    out.put_u32(u32::from(*endpoint.ip()));
    out.put_u16(endpoint.port());
    let secondary = secondary.unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    out.put_u32(u32::from(*secondary.ip()));
    out.put_u16(secondary.port());
    Ok(())
}

struct ConnectionFields {
    version: ProtocolVersion,
    name: String,
    kind: String,
    service_type: ServiceType,
    endpoint: SocketAddrV4,
    secondary: Option<SocketAddrV4>,
}

fn get_connection(buf: &mut &[u8]) -> Result<ConnectionFields, DecodeError> {
    let major = get_u16(buf, "major version")?;
    let minor = get_u16(buf, "minor version")?;
    let name = get_fixed_str(buf, NAME_LEN, "station name")?;
    let kind = get_fixed_str(buf, TYPE_LEN, "station type")?;
    let service_type = get_fixed_str(buf, SERVICE_LEN, "service type")?
        .parse::<ServiceType>()
        .map_err(|e| DecodeError::malformed("service type", e))?;
    let ip = Ipv4Addr::from(get_u32(buf, "address")?);
    let port = get_u16(buf, "port")?;
    let secondary_ip = Ipv4Addr::from(get_u32(buf, "secondary address")?);
    let secondary_port = get_u16(buf, "secondary port")?;

    let secondary = (!secondary_ip.is_unspecified() || secondary_port != 0)
        .then(|| SocketAddrV4::new(secondary_ip, secondary_port));

    Ok(ConnectionFields {
        version: ProtocolVersion { major, minor },
        name,
        kind,
        service_type,
        endpoint: SocketAddrV4::new(ip, port),
        secondary,
    })
}

fn get_options(buf: &mut &[u8]) -> Result<Vec<FrameOption>, DecodeError> {
    let count = get_len(buf, 8, "option count")?;
    let mut options = Vec::with_capacity(count);
    for _ in 0..count {
        let option_type = get_u32(buf, "option type")?;
        let value = get_sized(buf, "option value")?;
        options.push(FrameOption { option_type, value });
    }
    Ok(options)
}

/// `u64::MAX` is the wire's "nothing received" marker and cannot be sent as a value.
fn ack_sequence(seq: Option<u64>, field: &str) -> Result<u64> {
    match seq {
        None => Ok(NO_SEQUENCE),
        Some(NO_SEQUENCE) => Err(Cd11Error::encode(field, "u64::MAX is reserved for \"nothing received\"")),
        Some(seq) => Ok(seq),
    }
}

/// Exclusive end as sent. An open-ended gap keeps `u64::MAX`, which leaves an inclusive
/// end of `u64::MAX - 1` with no encoding of its own.
fn gap_end_exclusive(gap: &SequenceRange) -> Result<u64> {
    match gap.end() {
        u64::MAX => Ok(u64::MAX),
        end if end == u64::MAX - 1 => {
            Err(Cd11Error::encode("gap end", format!("{gap} ends at u64::MAX - 1, which the wire cannot carry")))
        }
        end => Ok(end + 1),
    }
}

fn get_acknowledgment(buf: &mut &[u8]) -> Result<Acknowledgment, DecodeError> {
    let frameset_acked = get_fixed_str(buf, FRAMESET_LEN, "frameset acked")?;
    let lowest = get_u64(buf, "lowest sequence")?;
    let highest = get_u64(buf, "highest sequence")?;
    let count = get_len(buf, 16, "gap count")?;

    let mut gaps = Vec::with_capacity(count);
    for _ in 0..count {
        let start = get_u64(buf, "gap start")?;
        let end_exclusive = get_u64(buf, "gap end")?;
        let end = match end_exclusive {
            u64::MAX => u64::MAX,
            0 => return Err(DecodeError::malformed("gap", "zero exclusive end")),
            e => e - 1,
        };
        let gap = SequenceRange::new(start, end).ok_or_else(|| {
            DecodeError::malformed("gap", format!("start {start} beyond end {end_exclusive}"))
        })?;
        gaps.push(gap);
    }

    Ok(Acknowledgment {
        frameset_acked,
        lowest_seq: (lowest != NO_SEQUENCE).then_some(lowest),
        highest_seq: (highest != NO_SEQUENCE).then_some(highest),
        gaps,
    })
}

fn put_data(out: &mut BytesMut, data: &DataFrame) -> Result<()> {
    put_u32_len(out, data.subframes.len(), "channel count")?;
    out.put_u32(data.frame_time_length_ms);
    put_fixed_str(out, &data.nominal_time.to_string(), TIMESTAMP_LEN, "nominal time")?;

    let string_len = data.subframes.len() * CHANNEL_STRING_WIDTH;
    put_u32_len(out, string_len, "channel string count")?;
    for subframe in &data.subframes {
        let d = &subframe.description;
        put_fixed_str(out, &d.site, SITE_LEN, "site")?;
        put_fixed_str(out, &d.channel, CHANNEL_LEN, "channel")?;
        put_fixed_str(out, &d.location, LOCATION_LEN, "location")?;
    }
    out.put_bytes(0, padded_len(string_len) - string_len);

    for subframe in &data.subframes {
        put_subframe(out, subframe)?;
    }
    Ok(())
}

fn put_subframe(out: &mut BytesMut, subframe: &ChannelSubframe) -> Result<()> {
    let mut content = BytesMut::with_capacity(MIN_SUBFRAME_LEN + subframe.data.len());
    // auth offset is patched once the fields before it are written
    content.put_u32(0);
    put_description(&mut content, &subframe.description)?;
    put_fixed_str(&mut content, &subframe.timestamp.to_string(), TIMESTAMP_LEN, "subframe timestamp")?;
    content.put_u32(subframe.time_length_ms);
    content.put_u32(subframe.samples);
    put_sized(&mut content, &subframe.status, "channel status")?;
    put_sized(&mut content, &subframe.data, "channel data")?;
    content.put_u32(subframe.subframe_count);

    // offset from the first byte of the subframe, counting the length field
    let auth_offset = 4 + content.len();
    content[..4].copy_from_slice(&(auth_offset as u32).to_be_bytes());
    content.put_u32(subframe.auth_key_id);
    put_sized(&mut content, &subframe.auth_value, "subframe auth value")?;

    put_u32_len(out, content.len(), "channel length")?;
    out.extend_from_slice(&content);
    Ok(())
}

fn put_description(out: &mut BytesMut, d: &ChannelDescription) -> Result<()> {
    out.put_u8(u8::from(d.authenticated));
    out.put_u8(d.transformation);
    out.put_u8(d.sensor_type);
    out.put_u8(u8::from(d.calibration));
    put_fixed_str(out, &d.site, SITE_LEN, "site")?;
    put_fixed_str(out, &d.channel, CHANNEL_LEN, "channel")?;
    put_fixed_str(out, &d.location, LOCATION_LEN, "location")?;
    put_fixed_str(out, &d.data_type, DATA_TYPE_LEN, "data type")?;
    out.put_f32(d.calibration_factor);
    out.put_f32(d.calibration_period);
    Ok(())
}

fn get_timestamp(buf: &mut &[u8], field: &str) -> Result<JulianTimestamp, DecodeError> {
    let text = get_fixed_str(buf, TIMESTAMP_LEN, field)?;
    JulianTimestamp::parse(&text)
}

fn get_data(buf: &mut &[u8]) -> Result<DataFrame, DecodeError> {
    let channels = get_len(buf, MIN_SUBFRAME_LEN, "channel count")?;
    let frame_time_length_ms = get_u32(buf, "frame time length")?;
    let nominal_time = get_timestamp(buf, "nominal time")?;

    let string_len = get_len(buf, 1, "channel string count")?;
    if string_len != channels * CHANNEL_STRING_WIDTH {
        return Err(DecodeError::malformed(
            "channel string",
            format!("{} bytes for {} channels", string_len, channels),
        ));
    }
    get_padded(buf, string_len, "channel string")?;

    let mut subframes = Vec::with_capacity(channels);
    for _ in 0..channels {
        subframes.push(get_subframe(buf)?);
    }

    Ok(DataFrame { frame_time_length_ms, nominal_time, subframes })
}

fn get_subframe(buf: &mut &[u8]) -> Result<ChannelSubframe, DecodeError> {
    let channel_length = get_len(buf, 1, "channel length")?;
    if channel_length + 4 < MIN_SUBFRAME_LEN {
        return Err(DecodeError::malformed(
            "channel length",
            format!("{channel_length} is below the fixed subframe size"),
        ));
    }
    let whole: &[u8] = *buf;
    let (mut sub, rest) = whole.split_at(channel_length);
    *buf = rest;

    let _auth_offset = get_u32(&mut sub, "auth offset")?;
    let description = get_description(&mut sub)?;
    let timestamp = get_timestamp(&mut sub, "subframe timestamp")?;
    let time_length_ms = get_u32(&mut sub, "subframe time length")?;
    let samples = get_u32(&mut sub, "samples")?;
    let status = get_sized(&mut sub, "channel status")?;
    let data = get_sized(&mut sub, "channel data")?;
    let subframe_count = get_u32(&mut sub, "subframe count")?;
    let auth_key_id = get_u32(&mut sub, "subframe auth key")?;
    let auth_value = get_sized(&mut sub, "subframe auth value")?;
    expect_end(sub, "channel subframe")?;

    Ok(ChannelSubframe {
        description,
        timestamp,
        time_length_ms,
        samples,
        status,
        data,
        subframe_count,
        auth_key_id,
        auth_value,
    })
}

fn get_description(buf: &mut &[u8]) -> Result<ChannelDescription, DecodeError> {
    Ok(ChannelDescription {
        authenticated: get_u8(buf, "auth flag")? == 1,
        transformation: get_u8(buf, "transformation")?,
        sensor_type: get_u8(buf, "sensor type")?,
        calibration: get_u8(buf, "option flag")? == 1,
        site: get_fixed_str(buf, SITE_LEN, "site")?,
        channel: get_fixed_str(buf, CHANNEL_LEN, "channel")?,
        location: get_fixed_str(buf, LOCATION_LEN, "location")?,
        data_type: get_fixed_str(buf, DATA_TYPE_LEN, "data type")?,
        calibration_factor: get_f32(buf, "calibration factor")?,
        calibration_period: get_f32(buf, "calibration period")?,
    })
}
