//! Reconciliation between the desired server set and HAProxy's live state.
//!
//! [`check_stats`] classifies every live stats row against the desired set
//! and decides whether the config file must be rewritten (membership or
//! address divergence) or whether admin-state commands over the socket
//! suffice. [`sync_server_state`] is that cheap path: enables first, then
//! disables, then connection shutdowns for everything newly disabled.

use crate::{
    clients::haproxy::SocketError,
    stats::{SHOW_STAT_SERVERS, StatRow, StatsError, parse_stats, reply_is_blank},
    workers::socket::AdminSocket,
    workers::watch::ServerSet,
};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrongReason {
    /// Live row has no desired counterpart.
    NoServer,
    /// Live row's address disagrees with the registration.
    AddrMismatch,
    /// Desired enabled but administratively down.
    WantEnabled,
    /// Desired disabled but still taking traffic.
    WantDisabled,
}

impl fmt::Display for WrongReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::NoServer => "no-server",
            Self::AddrMismatch => "addr-mismatch",
            Self::WantEnabled => "want-enabled",
            Self::WantDisabled => "want-disabled",
        };
        write!(f, "{reason}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrongServer {
    pub pxname: String,
    pub svname: String,
    pub reason: WrongReason,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct StatsCheck {
    pub reload: bool,
    pub wrong: Vec<WrongServer>,
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("unmapped server: {pxname}/{svname}")]
    UnmappedServer { pxname: String, svname: String },

    #[error("haproxy-unexpected-output for `{command}`: {reply:?}")]
    UnexpectedOutput { command: String, reply: String },

    #[error(transparent)]
    Stats(#[from] StatsError),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Registration id encoded in a server name (`<id>:<port>`).
fn server_id(svname: &str) -> &str {
    svname.split(':').next().unwrap_or(svname)
}

/// Classify every live row against the desired set.
///
/// `reload` is raised by topology divergence: a live row with no desired
/// counterpart, a live address that contradicts the registration, or a
/// desired server with no live row at all.
pub fn check_stats(desired: &ServerSet, rows: &[StatRow]) -> StatsCheck {
    let mut check = StatsCheck::default();
    for row in rows {
        let svname = row.svname();
        let Some(backend) = desired.get(server_id(svname)) else {
            check.reload = true;
            check.wrong.push(WrongServer {
                pxname: row.pxname().to_string(),
                svname: svname.to_string(),
                reason: WrongReason::NoServer,
            });
            continue;
        };
        if backend.address != row.addr_host() {
            check.reload = true;
            check.wrong.push(WrongServer {
                pxname: row.pxname().to_string(),
                svname: svname.to_string(),
                reason: WrongReason::AddrMismatch,
            });
            continue;
        }
        if backend.enabled && row.in_maint() {
            check.wrong.push(WrongServer {
                pxname: row.pxname().to_string(),
                svname: svname.to_string(),
                reason: WrongReason::WantEnabled,
            });
        } else if !backend.enabled && !row.in_maint() {
            check.wrong.push(WrongServer {
                pxname: row.pxname().to_string(),
                svname: svname.to_string(),
                reason: WrongReason::WantDisabled,
            });
        }
    }

    for id in desired.keys() {
        if !rows.iter().any(|row| server_id(row.svname()) == id) {
            debug!(id = %id, "Desired server missing from live stats");
            check.reload = true;
        }
    }
    check
}

/// Query the stats socket, retrying an empty reply exactly once.
pub async fn query_stats(
    socket: &dyn AdminSocket,
    command: &str,
) -> Result<Vec<StatRow>, ReconcileError> {
    let reply = socket.command(command).await?;
    if reply_is_blank(&reply) {
        warn!(command, "Empty stats reply, retrying once");
        let reply = socket.command(command).await?;
        return Ok(parse_stats(&reply)?);
    }
    Ok(parse_stats(&reply)?)
}

/// The cheap path: bring admin state in line over the socket.
///
/// All enables run first, then all disables, then a session shutdown for
/// every newly-disabled server so lingering connections die. Each command
/// is its own round-trip. A live row that maps to no desired server is
/// fatal: the config file and the desired set have drifted apart.
pub async fn sync_server_state(
    desired: &ServerSet,
    socket: &dyn AdminSocket,
) -> Result<(), ReconcileError> {
    let rows = query_stats(socket, SHOW_STAT_SERVERS).await?;
    let check = check_stats(desired, &rows);

    let mut enable = Vec::new();
    let mut disable = Vec::new();
    for wrong in &check.wrong {
        match wrong.reason {
            WrongReason::NoServer => {
                return Err(ReconcileError::UnmappedServer {
                    pxname: wrong.pxname.clone(),
                    svname: wrong.svname.clone(),
                });
            }
            WrongReason::WantEnabled => enable.push(wrong),
            WrongReason::WantDisabled => disable.push(wrong),
            // Address drift is the config path's problem.
            WrongReason::AddrMismatch => {}
        }
    }

    for wrong in &enable {
        admin_command(socket, format!("enable server {}/{}", wrong.pxname, wrong.svname)).await?;
    }
    for wrong in &disable {
        admin_command(socket, format!("disable server {}/{}", wrong.pxname, wrong.svname)).await?;
    }
    for wrong in &disable {
        admin_command(socket, format!("shutdown sessions server {}/{}", wrong.pxname, wrong.svname))
            .await?;
    }
    debug!(enabled = enable.len(), disabled = disable.len(), "Admin state synced");
    Ok(())
}

/// Admin control commands reply with nothing but whitespace on success.
async fn admin_command(socket: &dyn AdminSocket, command: String) -> Result<(), ReconcileError> {
    let reply = socket.command(&command).await?;
    if !reply_is_blank(&reply) {
        return Err(ReconcileError::UnexpectedOutput {
            command,
            reply: String::from_utf8_lossy(&reply).into_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::{socket::MockAdminSocket, watch::Backend};
    use mockall::predicate::eq;
    use rstest::rstest;

    fn backend(id: &str, address: &str, enabled: bool) -> (String, Backend) {
        (
            id.to_string(),
            Backend { id: id.to_string(), kind: "webapi".into(), address: address.into(), enabled },
        )
    }

    const HEADER: &str = "# pxname,svname,status,addr,type,";

    fn stats_reply(rows: &[(&str, &str, &str, &str)]) -> String {
        let mut reply = format!("{HEADER}\n");
        for (pxname, svname, status, addr) in rows {
            reply.push_str(&format!("{pxname},{svname},{status},{addr},2,\n"));
        }
        reply
    }

    fn rows(reply: &str) -> Vec<StatRow> {
        parse_stats(reply.as_bytes()).expect("reply parses")
    }

    #[rstest]
    #[case::enabled_up("10.0.0.1", true, "UP", None)]
    #[case::enabled_maint("10.0.0.1", true, "MAINT", Some(WrongReason::WantEnabled))]
    #[case::enabled_maint_via("10.0.0.1", true, "MAINT(via x/y)", Some(WrongReason::WantEnabled))]
    #[case::enabled_down("10.0.0.1", true, "DOWN", None)]
    #[case::disabled_maint("10.0.0.1", false, "MAINT", None)]
    #[case::disabled_up("10.0.0.1", false, "UP", Some(WrongReason::WantDisabled))]
    #[case::disabled_down("10.0.0.1", false, "DOWN", Some(WrongReason::WantDisabled))]
    #[case::addr_drift("10.0.0.2", true, "UP", Some(WrongReason::AddrMismatch))]
    fn classification_table(
        #[case] desired_addr: &str,
        #[case] enabled: bool,
        #[case] status: &str,
        #[case] expected: Option<WrongReason>,
    ) {
        let desired: ServerSet = [backend("a", desired_addr, enabled)].into_iter().collect();
        let reply = stats_reply(&[("secure_api", "a:80", status, "10.0.0.1:80")]);
        let check = check_stats(&desired, &rows(&reply));
        match expected {
            None => assert!(check.wrong.is_empty(), "unexpected: {:?}", check.wrong),
            Some(reason) => {
                assert_eq!(check.wrong.len(), 1);
                assert_eq!(check.wrong[0].reason, reason);
            }
        }
        let topology_divergence =
            matches!(expected, Some(WrongReason::AddrMismatch) | Some(WrongReason::NoServer));
        assert_eq!(check.reload, topology_divergence);
    }

    #[test]
    fn unknown_live_row_forces_reload() {
        // Desired knows A and C; live rows carry B on both pools.
        let desired: ServerSet =
            [backend("A", "127.0.0.1", true), backend("C", "127.0.0.1", true)].into_iter().collect();
        let reply = stats_reply(&[
            ("secure_api", "A:80", "UP", "127.0.0.1:80"),
            ("insecure_api", "A:81", "UP", "127.0.0.1:81"),
            ("secure_api", "B:6781", "UP", "127.0.0.2:6781"),
            ("insecure_api", "B:6781", "UP", "127.0.0.2:6781"),
            ("secure_api", "C:80", "UP", "127.0.0.1:80"),
            ("insecure_api", "C:81", "UP", "127.0.0.1:81"),
        ]);
        let check = check_stats(&desired, &rows(&reply));
        assert!(check.reload);
        let wrong: Vec<_> = check.wrong.iter().map(|w| (w.svname.as_str(), w.reason)).collect();
        assert_eq!(wrong, vec![("B:6781", WrongReason::NoServer), ("B:6781", WrongReason::NoServer)]);
    }

    #[test]
    fn address_drift_forces_reload() {
        let desired: ServerSet = [
            backend("A", "127.0.0.1", true),
            backend("B", "127.0.0.2", true),
            backend("C", "127.0.0.1", true),
        ]
        .into_iter()
        .collect();
        let reply = stats_reply(&[
            ("secure_api", "A:80", "UP", "127.0.0.1:80"),
            ("insecure_api", "A:81", "UP", "127.0.0.1:81"),
            ("secure_api", "B:80", "UP", "127.0.0.1:80"),
            ("insecure_api", "B:81", "UP", "127.0.0.1:81"),
            ("secure_api", "C:80", "UP", "127.0.0.1:80"),
            ("insecure_api", "C:81", "UP", "127.0.0.1:81"),
        ]);
        let check = check_stats(&desired, &rows(&reply));
        assert!(check.reload);
        let wrong: Vec<_> = check.wrong.iter().map(|w| (w.svname.as_str(), w.reason)).collect();
        assert_eq!(wrong, vec![("B:80", WrongReason::AddrMismatch), ("B:81", WrongReason::AddrMismatch)]);
    }

    #[test]
    fn disabled_server_wants_disabling_without_reload() {
        let desired: ServerSet = [
            backend("A", "127.0.0.1", true),
            backend("B", "127.0.0.1", false),
            backend("C", "127.0.0.1", true),
        ]
        .into_iter()
        .collect();
        let reply = stats_reply(&[
            ("secure_api", "A:80", "UP", "127.0.0.1:80"),
            ("insecure_api", "A:81", "UP", "127.0.0.1:81"),
            ("secure_api", "B:80", "UP", "127.0.0.1:80"),
            ("insecure_api", "B:81", "UP", "127.0.0.1:81"),
            ("secure_api", "C:80", "UP", "127.0.0.1:80"),
            ("insecure_api", "C:81", "UP", "127.0.0.1:81"),
        ]);
        let check = check_stats(&desired, &rows(&reply));
        assert!(!check.reload);
        let wrong: Vec<_> = check.wrong.iter().map(|w| (w.svname.as_str(), w.reason)).collect();
        assert_eq!(wrong, vec![("B:80", WrongReason::WantDisabled), ("B:81", WrongReason::WantDisabled)]);
    }

    fn expect_stats(socket: &mut MockAdminSocket, reply: String) {
        socket
            .expect_command()
            .with(eq(SHOW_STAT_SERVERS))
            .times(1)
            .return_once(move |_| Ok(reply.into_bytes()));
    }

    fn expect_blank(socket: &mut MockAdminSocket, command: &str) {
        socket.expect_command().with(eq(command.to_string())).times(1).return_once(|_| Ok(b"\n".to_vec()));
    }

    #[tokio::test]
    async fn sync_disables_then_enables_back() {
        // Desired has B disabled while live shows it active: expect a
        // disable plus a session shutdown on both pools.
        let desired: ServerSet = [
            backend("A", "127.0.0.1", true),
            backend("B", "127.0.0.1", false),
            backend("C", "127.0.0.1", true),
        ]
        .into_iter()
        .collect();

        let mut socket = MockAdminSocket::new();
        let mut sequence = mockall::Sequence::new();
        let reply = stats_reply(&[
            ("secure_api", "A:80", "UP", "127.0.0.1:80"),
            ("secure_api", "B:80", "UP", "127.0.0.1:80"),
            ("insecure_api", "B:81", "UP", "127.0.0.1:81"),
            ("insecure_api", "C:81", "UP", "127.0.0.1:81"),
            ("secure_api", "C:80", "UP", "127.0.0.1:80"),
            ("insecure_api", "A:81", "UP", "127.0.0.1:81"),
        ]);
        socket
            .expect_command()
            .with(eq(SHOW_STAT_SERVERS))
            .times(1)
            .in_sequence(&mut sequence)
            .return_once(move |_| Ok(reply.into_bytes()));
        for command in [
            "disable server secure_api/B:80",
            "disable server insecure_api/B:81",
            "shutdown sessions server secure_api/B:80",
            "shutdown sessions server insecure_api/B:81",
        ] {
            socket
                .expect_command()
                .with(eq(command.to_string()))
                .times(1)
                .in_sequence(&mut sequence)
                .return_once(|_| Ok(Vec::new()));
        }
        sync_server_state(&desired, &socket).await.expect("sync");

        // Once B sits in MAINT, flipping it back to enabled classifies as
        // want-enabled on both pools, still without a reload.
        let desired: ServerSet = [
            backend("A", "127.0.0.1", true),
            backend("B", "127.0.0.1", true),
            backend("C", "127.0.0.1", true),
        ]
        .into_iter()
        .collect();
        let reply = stats_reply(&[
            ("secure_api", "A:80", "UP", "127.0.0.1:80"),
            ("secure_api", "B:80", "MAINT", "127.0.0.1:80"),
            ("insecure_api", "B:81", "MAINT", "127.0.0.1:81"),
            ("secure_api", "C:80", "UP", "127.0.0.1:80"),
            ("insecure_api", "A:81", "UP", "127.0.0.1:81"),
            ("insecure_api", "C:81", "UP", "127.0.0.1:81"),
        ]);
        let check = check_stats(&desired, &rows(&reply));
        assert!(!check.reload);
        let wrong: Vec<_> = check.wrong.iter().map(|w| (w.svname.as_str(), w.reason)).collect();
        assert_eq!(wrong, vec![("B:80", WrongReason::WantEnabled), ("B:81", WrongReason::WantEnabled)]);

        let mut socket = MockAdminSocket::new();
        let reply = stats_reply(&[
            ("secure_api", "A:80", "UP", "127.0.0.1:80"),
            ("secure_api", "B:80", "MAINT", "127.0.0.1:80"),
            ("insecure_api", "B:81", "MAINT", "127.0.0.1:81"),
            ("secure_api", "C:80", "UP", "127.0.0.1:80"),
            ("insecure_api", "A:81", "UP", "127.0.0.1:81"),
            ("insecure_api", "C:81", "UP", "127.0.0.1:81"),
        ]);
        expect_stats(&mut socket, reply);
        expect_blank(&mut socket, "enable server secure_api/B:80");
        expect_blank(&mut socket, "enable server insecure_api/B:81");
        sync_server_state(&desired, &socket).await.expect("sync");
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let desired: ServerSet =
            [backend("A", "127.0.0.1", true), backend("B", "127.0.0.1", false)].into_iter().collect();
        let converged = stats_reply(&[
            ("secure_api", "A:80", "UP", "127.0.0.1:80"),
            ("secure_api", "B:80", "MAINT", "127.0.0.1:80"),
        ]);

        // A converged state produces zero commands: only the stats query
        // itself hits the socket.
        let mut socket = MockAdminSocket::new();
        expect_stats(&mut socket, converged.clone());
        sync_server_state(&desired, &socket).await.expect("first sync");

        let mut socket = MockAdminSocket::new();
        expect_stats(&mut socket, converged);
        sync_server_state(&desired, &socket).await.expect("second sync");
    }

    #[tokio::test]
    async fn unmapped_server_is_fatal() {
        let desired: ServerSet =
            [backend("A", "127.0.0.1", true), backend("C", "127.0.0.1", true)].into_iter().collect();
        let mut socket = MockAdminSocket::new();
        let reply = stats_reply(&[
            ("secure_api", "A:80", "UP", "127.0.0.1:80"),
            ("secure_api", "B:6781", "UP", "127.0.0.1:6781"),
            ("secure_api", "C:80", "UP", "127.0.0.1:80"),
        ]);
        expect_stats(&mut socket, reply);
        let err = sync_server_state(&desired, &socket).await.unwrap_err();
        assert!(err.to_string().contains("unmapped server: secure_api/B:6781"));
    }

    #[tokio::test]
    async fn empty_stats_reply_is_retried_once() {
        let mut socket = MockAdminSocket::new();
        let mut sequence = mockall::Sequence::new();
        socket
            .expect_command()
            .with(eq(SHOW_STAT_SERVERS))
            .times(1)
            .in_sequence(&mut sequence)
            .return_once(|_| Ok(b"\n".to_vec()));
        let reply = stats_reply(&[("secure_api", "A:80", "UP", "127.0.0.1:80")]);
        socket
            .expect_command()
            .with(eq(SHOW_STAT_SERVERS))
            .times(1)
            .in_sequence(&mut sequence)
            .return_once(move |_| Ok(reply.into_bytes()));

        let rows = query_stats(&socket, SHOW_STAT_SERVERS).await.expect("query");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn persistently_empty_reply_is_an_error() {
        let mut socket = MockAdminSocket::new();
        socket.expect_command().times(2).returning(|_| Ok(Vec::new()));
        let err = query_stats(&socket, SHOW_STAT_SERVERS).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Stats(StatsError::EmptyReply)));
    }

    #[tokio::test]
    async fn chatty_control_reply_is_an_error() {
        let desired: ServerSet = [backend("B", "127.0.0.1", false)].into_iter().collect();
        let mut socket = MockAdminSocket::new();
        expect_stats(&mut socket, stats_reply(&[("secure_api", "B:80", "UP", "127.0.0.1:80")]));
        socket
            .expect_command()
            .with(eq("disable server secure_api/B:80".to_string()))
            .times(1)
            .return_once(|_| Ok(b"No such server.\n".to_vec()));
        let err = sync_server_state(&desired, &socket).await.unwrap_err();
        assert!(matches!(err, ReconcileError::UnexpectedOutput { .. }));
    }
}
