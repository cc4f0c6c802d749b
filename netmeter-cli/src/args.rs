// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Hand-written argument walker for the CLI surface of spec.md §6.1. The
//! flow-spec grammar interleaves stateful flags (selecting the next flow's
//! protocol) with positional comma-separated specs, which a derive-based
//! parser does not fit; this mirrors how the original tool walked `argv`
//! itself.

use netmeter_core::error::{Error, Result};
use netmeter_core::onoff::OnOffEvent;
use netmeter_core::randomvar::RandomVariable;
use netmeter_core::trafficspec::{DirectionSpec, Protocol, TrafficSpec};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Whether this process is driving the measurement (`Active`) or answering
/// it (`Passive`), selected by the first positional argument per spec.md
/// §6.1.
#[derive(Clone, Debug)]
pub enum Role {
    Active { remote: SocketAddr },
    Passive { port: u16 },
}

/// Global flags that apply regardless of role.
#[derive(Clone, Debug)]
pub struct GlobalOptions {
    pub runtime: Option<Duration>,
    pub control_over_tcp: bool,
    pub active_node_name: String,
    pub passive_node_name: String,
    pub pathmgr: String,
    pub scheduler: String,
    pub sndbuf: u32,
    pub rcvbuf: u32,
    pub v6only: bool,
    pub quiet: bool,
    pub verbose: bool,
    pub verbosity: u8,
    pub local_addrs: Vec<IpAddr>,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            runtime: None,
            control_over_tcp: false,
            active_node_name: "active".to_string(),
            passive_node_name: "passive".to_string(),
            pathmgr: String::new(),
            scheduler: String::new(),
            sndbuf: 0,
            rcvbuf: 0,
            v6only: false,
            quiet: false,
            verbose: false,
            verbosity: 0,
            local_addrs: Vec::new(),
        }
    }
}

/// One flow spec parsed off the command line, with its assigned identifiers.
#[derive(Clone, Debug)]
pub struct FlowArg {
    pub flow_id: u32,
    pub stream_id: u16,
    pub traffic_spec: TrafficSpec,
}

/// Fully parsed command line.
#[derive(Clone, Debug)]
pub struct Config {
    pub role: Role,
    pub global: GlobalOptions,
    pub vector_pattern: String,
    pub vector_compressed: bool,
    pub scalar_pattern: String,
    pub scalar_compressed: bool,
    pub config_path: String,
    pub flows: Vec<FlowArg>,
}

/// Parses `argv` (not including `argv[0]`), per spec.md §6.1.
pub fn parse(argv: &[String]) -> Result<Config> {
    let mut args = argv.iter();
    let role_token = args
        .next()
        .ok_or_else(|| Error::config("missing endpoint argument (host:port or local port)"))?;
    let role = parse_role(role_token)?;

    let mut global = GlobalOptions::default();
    let mut vector_raw = String::new();
    let mut scalar_raw = String::new();
    let mut config_path = String::new();
    let mut current_protocol = Protocol::Tcp;
    let mut flows = Vec::new();
    let mut next_flow_id: u32 = 0;
    let mut seen_flow = false;

    for arg in args {
        if let Some(rest) = arg.strip_prefix('-') {
            let is_pre_flow_only = rest.starts_with("vector=") || rest.starts_with("scalar=") || rest.starts_with("config=");
            if is_pre_flow_only && seen_flow {
                return Err(Error::config(format!("-{rest} must appear before any flow spec")));
            }
            parse_flag(
                rest,
                &mut global,
                &mut current_protocol,
                &mut vector_raw,
                &mut scalar_raw,
                &mut config_path,
            )?;
        } else {
            seen_flow = true;
            let flow_id = next_flow_id;
            let (spec, explicit_id) = parse_flow_spec(arg, current_protocol, &global)?;
            let flow_id = explicit_id.unwrap_or(flow_id);
            next_flow_id = next_flow_id.max(flow_id.wrapping_add(1));
            flows.push(FlowArg {
                flow_id,
                stream_id: 0,
                traffic_spec: spec,
            });
        }
    }

    if matches!(role, Role::Active { .. }) && flows.is_empty() {
        return Err(Error::config("active side requires at least one flow spec"));
    }

    let (vector_pattern, vector_compressed) = split_pattern(&vector_raw);
    let (scalar_pattern, scalar_compressed) = split_pattern(&scalar_raw);

    Ok(Config {
        role,
        global,
        vector_pattern,
        vector_compressed,
        scalar_pattern,
        scalar_compressed,
        config_path,
        flows,
    })
}

fn parse_role(token: &str) -> Result<Role> {
    if let Ok(port) = token.parse::<u16>() {
        if !(1023 < port && port < 65535) {
            return Err(Error::config(format!(
                "local port {port} out of range (must be >1023 and <65535)"
            )));
        }
        return Ok(Role::Passive { port });
    }

    let (host, port_str) = token
        .rsplit_once(':')
        .ok_or_else(|| Error::config(format!("'{token}' is neither a port nor a host:port endpoint")))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| Error::config(format!("invalid port in endpoint '{token}'")))?;
    if !(1023 < port && port < 65535) {
        return Err(Error::config(format!(
            "remote port {port} out of range (must be >1023 and <65535)"
        )));
    }
    let remote = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::config(format!("cannot resolve '{host}': {e}")))?
        .next()
        .ok_or_else(|| Error::config(format!("'{host}' resolved to no addresses")))?;
    Ok(Role::Active { remote })
}

fn split_pattern(raw: &str) -> (String, bool) {
    if raw.is_empty() {
        return (String::new(), false);
    }
    match raw.strip_suffix(".bz2") {
        Some(stripped) => (stripped.to_string(), true),
        None => (raw.to_string(), false),
    }
}

#[allow(clippy::too_many_arguments)]
fn parse_flag(
    rest: &str,
    global: &mut GlobalOptions,
    current_protocol: &mut Protocol,
    vector_raw: &mut String,
    scalar_raw: &mut String,
    config_path: &mut String,
) -> Result<()> {
    match rest {
        "tcp" => return set_protocol(current_protocol, Protocol::Tcp),
        "udp" => return set_protocol(current_protocol, Protocol::Udp),
        "sctp" => return set_protocol(current_protocol, Protocol::Sctp),
        "dccp" => return set_protocol(current_protocol, Protocol::Dccp),
        "control-over-tcp" => {
            global.control_over_tcp = true;
            return Ok(());
        }
        "v6only" => {
            global.v6only = true;
            return Ok(());
        }
        "quiet" => {
            global.quiet = true;
            return Ok(());
        }
        "verbose" => {
            global.verbose = true;
            return Ok(());
        }
        _ => {}
    }

    let (key, value) = rest
        .split_once('=')
        .ok_or_else(|| Error::config(format!("unrecognized flag '-{rest}'")))?;

    match key {
        "runtime" => {
            global.runtime = Some(Duration::from_secs_f64(parse_num(value)?));
        }
        "activenodename" => global.active_node_name = value.to_string(),
        "passivenodename" => global.passive_node_name = value.to_string(),
        "pathmgr" => global.pathmgr = value.to_string(),
        "scheduler" => global.scheduler = value.to_string(),
        "sndbuf" => global.sndbuf = parse_int(value)?,
        "rcvbuf" => global.rcvbuf = parse_int(value)?,
        "verbosity" => global.verbosity = parse_int(value)?,
        "local" => {
            global.local_addrs = value
                .split(',')
                .map(|a| a.parse::<IpAddr>().map_err(|_| Error::config(format!("invalid -local address '{a}'"))))
                .collect::<Result<Vec<IpAddr>>>()?;
        }
        "vector" => *vector_raw = value.to_string(),
        "scalar" => *scalar_raw = value.to_string(),
        "config" => *config_path = value.to_string(),
        _ => return Err(Error::config(format!("unrecognized flag '-{rest}'"))),
    }
    Ok(())
}

fn set_protocol(current: &mut Protocol, protocol: Protocol) -> Result<()> {
    *current = protocol;
    Ok(())
}

/// Parses one flow spec, per spec.md §6.1: `default[,<opt>...]` or
/// `<outRate>,<outSize>,<inRate>,<inSize>[,<opt>...]`. Returns the built
/// spec plus an explicit `id=` override if present.
fn parse_flow_spec(spec: &str, protocol: Protocol, global: &GlobalOptions) -> Result<(TrafficSpec, Option<u32>)> {
    let fields: Vec<&str> = spec.split(',').collect();
    if fields.is_empty() || fields[0].is_empty() {
        return Err(Error::config("empty flow spec"));
    }

    let mut traffic = TrafficSpec {
        protocol,
        snd_buffer_size: global.sndbuf,
        rcv_buffer_size: global.rcvbuf,
        v6only: global.v6only,
        path_mgr: global.pathmgr.clone(),
        ..TrafficSpec::default()
    };

    let mut idx = 0usize;
    if fields[0] == "default" {
        idx = 1;
    } else {
        if fields.len() < 4 {
            return Err(Error::config(format!(
                "flow spec '{spec}' needs outRate,outSize,inRate,inSize or 'default'"
            )));
        }
        let out_rate = consume_rate_or_size(&fields, &mut idx)?;
        let out_size = consume_rate_or_size(&fields, &mut idx)?;
        let in_rate = consume_rate_or_size(&fields, &mut idx)?;
        let in_size = consume_rate_or_size(&fields, &mut idx)?;
        traffic.outbound = DirectionSpec {
            frame_rate: out_rate,
            frame_size: out_size,
        };
        traffic.inbound = DirectionSpec {
            frame_rate: in_rate,
            frame_size: in_size,
        };
    }

    let mut explicit_id = None;
    while idx < fields.len() {
        let field = fields[idx];
        idx += 1;
        if field.is_empty() {
            continue;
        }
        apply_flow_option(&mut traffic, field, &mut explicit_id)?;
    }

    Ok((traffic, explicit_id))
}

/// Consumes one rate/size token at `fields[*idx]`, per spec.md §4.5.1/§6.1:
/// `const<x>`, `exp<x>`, `uniform<x>,<y>`, `pareto<m>,<k>`, or a bare number.
/// `uniform`/`pareto` consume one extra field for their second parameter,
/// since the whole flow spec is comma-joined alongside them.
fn consume_rate_or_size(fields: &[&str], idx: &mut usize) -> Result<RandomVariable> {
    let field = *fields
        .get(*idx)
        .ok_or_else(|| Error::config("flow spec ended mid rate/size token"))?;
    *idx += 1;

    if let Some(rest) = field.strip_prefix("const") {
        return Ok(RandomVariable::constant(parse_num(rest)?));
    }
    if let Some(rest) = field.strip_prefix("exp") {
        return Ok(RandomVariable::exponential(parse_num(rest)?));
    }
    if let Some(rest) = field.strip_prefix("uniform") {
        let hi_field = fields
            .get(*idx)
            .ok_or_else(|| Error::config("uniform<x> missing its ,<y> field"))?;
        *idx += 1;
        return Ok(RandomVariable::uniform(parse_num(rest)?, parse_num(hi_field)?));
    }
    if let Some(rest) = field.strip_prefix("pareto") {
        let k_field = fields
            .get(*idx)
            .ok_or_else(|| Error::config("pareto<m> missing its ,<k> field"))?;
        *idx += 1;
        return Ok(RandomVariable::pareto(parse_num(rest)?, parse_num(k_field)?));
    }
    Ok(RandomVariable::constant(parse_num(field)?))
}

fn apply_flow_option(traffic: &mut TrafficSpec, field: &str, explicit_id: &mut Option<u32>) -> Result<()> {
    if field == "v6only" {
        traffic.v6only = true;
        return Ok(());
    }

    let (key, value) = field
        .split_once('=')
        .ok_or_else(|| Error::config(format!("unrecognized flow option '{field}'")))?;

    match key {
        "id" => *explicit_id = Some(parse_int(value)?),
        "maxmsgsize" => traffic.max_msg_size = parse_int(value)?,
        "defragtimeout" => traffic.defragment_timeout = Duration::from_millis(parse_int::<u64>(value)?),
        "ordered" => traffic.ordered_mode = parse_num(value)?,
        "unordered" => traffic.ordered_mode = 1.0 - parse_num(value)?,
        "reliable" => traffic.reliable_mode = parse_num(value)?,
        "unreliable" => traffic.reliable_mode = 1.0 - parse_num(value)?,
        "rtx_timeout" => {
            traffic.retransmission_trials = parse_int(value)?;
            traffic.retransmission_trials_in_ms = true;
        }
        "rtx_trials" => {
            traffic.retransmission_trials = parse_int(value)?;
            traffic.retransmission_trials_in_ms = false;
        }
        "rcvbuf" => traffic.rcv_buffer_size = parse_int(value)?,
        "sndbuf" => traffic.snd_buffer_size = parse_int(value)?,
        "cmt" => traffic.cmt = parse_cmt(value)?,
        "ccid" => traffic.ccid = parse_int(value)?,
        "error_on_abort" => {} // not carried on the wire; accepted for compatibility
        "description" => traffic.description = value.to_string(),
        "onoff" => traffic.on_off_events.extend(parse_onoff(value)?),
        "nodelay" => traffic.no_delay = parse_on_off(value)?,
        "debug" => traffic.debug = parse_on_off(value)?,
        "ndiffports" => traffic.n_diff_ports = parse_int(value)?,
        "pathmgr" => traffic.path_mgr = value.to_string(),
        "scheduler" => {} // carried via the control-channel path_mgr/cc strings only
        "cc" => traffic.congestion_control = value.to_string(),
        _ => return Err(Error::config(format!("unrecognized flow option '{field}'"))),
    }
    Ok(())
}

fn parse_cmt(value: &str) -> Result<u8> {
    match value {
        "off" => Ok(0),
        "cmt" => Ok(1),
        "cmtrpv1" => Ok(1),
        "cmtrpv2" => Ok(2),
        "like-mptcp" | "mptcp" => Ok(3),
        other => parse_int(other),
    }
}

fn parse_on_off(value: &str) -> Result<bool> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(Error::config(format!("expected 'on' or 'off', got '{other}'"))),
    }
}

/// Parses `onoff=[+|repeat]<event>:...`, per spec.md §6.1. Each colon-joined
/// segment may be prefixed with `repeat` (repeat the cycle) and/or `+`
/// (relative time), ahead of a rate/size-shaped token.
fn parse_onoff(value: &str) -> Result<Vec<OnOffEvent>> {
    value
        .split(':')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            let (repeat, segment) = match segment.strip_prefix("repeat") {
                Some(rest) => (true, rest),
                None => (false, segment),
            };
            let (relative, token) = match segment.strip_prefix('+') {
                Some(rest) => (true, rest),
                None => (false, segment),
            };
            netmeter_core::onoff::parse_event_spec(token, relative, repeat)
                .ok_or_else(|| Error::config(format!("invalid onoff event '{segment}'")))
        })
        .collect()
}

fn parse_num(s: &str) -> Result<f64> {
    s.parse().map_err(|_| Error::config(format!("invalid number '{s}'")))
}

fn parse_int<T: std::str::FromStr>(s: &str) -> Result<T> {
    s.parse().map_err(|_| Error::config(format!("invalid integer '{s}'")))
}
