//! Codis slot commands.

use super::{check_arity, check_exact, lower, parse_i64, parse_u64, CmdCategory, CmdContext, CommandRegistry, HandlerFuture};
use crate::error::{Result, XdisError};
use crate::migrate::{self, MigrateTarget, MigrateUnit};
use crate::reply::Reply;
use crate::session::Session;
use crate::storage::{RestoreEntry, SlotInfo, SlotStore};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn register(registry: &mut CommandRegistry) {
    let cat = CmdCategory::Slot;
    registry.register_sync("slotscheck", cat, slotscheck);
    registry.register_sync("slotsdel", cat, slotsdel);
    registry.register_sync("slotshashkey", cat, slotshashkey);
    registry.register_sync("slotsinfo", cat, slotsinfo);
    registry.register_async("slotsmgrtone", cat, slotsmgrtone);
    registry.register_async("slotsmgrtslot", cat, slotsmgrtslot);
    registry.register_async("slotsmgrttagone", cat, slotsmgrttagone);
    registry.register_async("slotsmgrttagslot", cat, slotsmgrttagslot);
    registry.register_sync("slotsrestore", cat, slotsrestore);
}

fn slot_store(s: &Session) -> Result<&dyn SlotStore> {
    s.db()
        .slots()
        .ok_or_else(|| XdisError::InvalidArgument("slots are not supported by this backend".to_string()))
}

fn slot_infos(infos: Vec<SlotInfo>) -> Reply {
    Reply::Array(
        infos
            .into_iter()
            .map(|i| Reply::ints([i.slot as i64, i.size as i64]))
            .collect(),
    )
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// SLOTSCHECK
fn slotscheck(_: CmdContext<'_>, s: &mut Session, _: &[Bytes]) -> Result<Reply> {
    slot_store(s)?.check()?;
    Ok(Reply::ok())
}

/// SLOTSDEL slot [slot ...]
fn slotsdel(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_arity("slotsdel", args, 1)?;
    let slots = args
        .iter()
        .map(|a| parse_u64(a))
        .collect::<Result<Vec<_>>>()?;
    Ok(slot_infos(slot_store(s)?.slots_del(&slots)?))
}

/// SLOTSHASHKEY key [key ...]
fn slotshashkey(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_arity("slotshashkey", args, 1)?;
    let slots = slot_store(s)?.hash_keys(args)?;
    Ok(Reply::ints(slots.into_iter().map(|n| n as i64)))
}

/// SLOTSINFO [start [count [WITHSIZE]]]
fn slotsinfo(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    if args.len() > 3 {
        return Err(XdisError::WrongArgCount("slotsinfo".to_string()));
    }
    let start = args.first().map(|a| parse_u64(a)).transpose()?.unwrap_or(0);
    let count = args.get(1).map(|a| parse_u64(a)).transpose()?.unwrap_or(0);
    let with_size = args.get(2).is_some_and(|a| lower(a) == "withsize");
    Ok(slot_infos(slot_store(s)?.slots_info(start, count, with_size)?))
}

/// `host port timeout_ms` prefix shared by the SLOTSMGRT* family.
fn parse_target(cmd: &str, args: &[Bytes]) -> Result<MigrateTarget> {
    check_exact(cmd, args, 4)?;
    let host = String::from_utf8_lossy(&args[0]);
    let port = u16::try_from(parse_i64(&args[1])?).map_err(|_| XdisError::Value)?;
    let timeout_ms = u64::try_from(parse_i64(&args[2])?).map_err(|_| XdisError::Value)?;
    Ok(MigrateTarget::new(
        format!("{}:{}", host, port),
        Duration::from_millis(timeout_ms),
    ))
}

async fn migrate_unit(
    cmd: &str,
    s: &Session,
    args: &[Bytes],
    unit: impl FnOnce(&Bytes) -> Result<MigrateUnit>,
) -> Result<Reply> {
    let target = parse_target(cmd, args)?;
    let unit = unit(&args[3])?;
    let db = Arc::clone(s.db());
    let slots = db
        .slots()
        .ok_or_else(|| XdisError::InvalidArgument("slots are not supported by this backend".to_string()))?;
    Ok(Reply::Int(migrate::migrate(slots, &target, unit).await?))
}

/// SLOTSMGRTONE host port timeout key
fn slotsmgrtone<'a>(_: CmdContext<'a>, s: &'a mut Session, args: &'a [Bytes]) -> HandlerFuture<'a> {
    Box::pin(migrate_unit("slotsmgrtone", s, args, |k| Ok(MigrateUnit::Key(k.clone()))))
}

/// SLOTSMGRTSLOT host port timeout slot
fn slotsmgrtslot<'a>(_: CmdContext<'a>, s: &'a mut Session, args: &'a [Bytes]) -> HandlerFuture<'a> {
    Box::pin(migrate_unit("slotsmgrtslot", s, args, |a| Ok(MigrateUnit::Slot(parse_u64(a)?))))
}

/// SLOTSMGRTTAGONE host port timeout key
fn slotsmgrttagone<'a>(_: CmdContext<'a>, s: &'a mut Session, args: &'a [Bytes]) -> HandlerFuture<'a> {
    Box::pin(migrate_unit("slotsmgrttagone", s, args, |k| Ok(MigrateUnit::TagKey(k.clone()))))
}

/// SLOTSMGRTTAGSLOT host port timeout slot
fn slotsmgrttagslot<'a>(_: CmdContext<'a>, s: &'a mut Session, args: &'a [Bytes]) -> HandlerFuture<'a> {
    Box::pin(migrate_unit("slotsmgrttagslot", s, args, |a| {
        Ok(MigrateUnit::TagSlot(parse_u64(a)?))
    }))
}

/// SLOTSRESTORE key ttl_ms value [key ttl_ms value ...]
///
/// The whole batch is validated before anything is written.
fn slotsrestore(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    if args.is_empty() || args.len() % 3 != 0 {
        return Err(XdisError::WrongArgCount("slotsrestore".to_string()));
    }
    let now = now_ms();
    let entries = args
        .chunks_exact(3)
        .map(|c| {
            let ttl = parse_i64(&c[1])?;
            if ttl < 0 {
                return Err(XdisError::InvalidArgument(format!(
                    "invalid ttl value {} for key '{}'",
                    ttl,
                    String::from_utf8_lossy(&c[0])
                )));
            }
            Ok(RestoreEntry {
                key: c[0].clone(),
                expire_at_ms: (ttl > 0).then(|| now.saturating_add(ttl as u64)),
                value: c[2].clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    slot_store(s)?.restore(&entries)?;
    Ok(Reply::ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::test_support::{args, TestServer};

    #[test]
    fn test_hashkey_and_info() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(
            slotshashkey(server.ctx(), &mut s, &args(&["foo", "{foo}bar"])).unwrap(),
            Reply::ints([918, 918])
        );
        s.db().strings().set(b"foo", Bytes::from("1"), Default::default()).unwrap();
        s.db().strings().set(b"{foo}x", Bytes::from("2"), Default::default()).unwrap();
        assert_eq!(
            slotsinfo(server.ctx(), &mut s, &[]).unwrap(),
            Reply::Array(vec![Reply::ints([918, 2])])
        );
        assert_eq!(
            slotsinfo(server.ctx(), &mut s, &args(&["0", "100"])).unwrap(),
            Reply::Array(vec![])
        );
        assert!(matches!(
            slotsinfo(server.ctx(), &mut s, &args(&["x"])),
            Err(XdisError::Value)
        ));
    }

    #[test]
    fn test_slotsdel() {
        let server = TestServer::new();
        let mut s = server.session();
        s.db().strings().set(b"foo", Bytes::from("1"), Default::default()).unwrap();
        assert_eq!(
            slotsdel(server.ctx(), &mut s, &args(&["918"])).unwrap(),
            Reply::Array(vec![Reply::ints([918, 0])])
        );
        assert_eq!(s.db().strings().get(b"foo").unwrap(), None);
        assert_eq!(slotscheck(server.ctx(), &mut s, &[]).unwrap(), Reply::ok());
    }

    #[test]
    fn test_restore_rejects_negative_ttl_batch() {
        let server = TestServer::new();
        let mut s = server.session();
        s.db().strings().set(b"src", Bytes::from("v"), Default::default()).unwrap();
        let dumped = s.db().slots().unwrap().dump(b"src").unwrap().unwrap().value;

        let batch = vec![
            Bytes::from("a"),
            Bytes::from("0"),
            dumped.clone(),
            Bytes::from("b"),
            Bytes::from("-5"),
            dumped.clone(),
        ];
        assert!(slotsrestore(server.ctx(), &mut s, &batch).is_err());
        assert_eq!(s.db().keys().exists(b"a").unwrap(), 0);
        assert_eq!(s.db().keys().exists(b"b").unwrap(), 0);

        let batch = vec![
            Bytes::from("a"),
            Bytes::from("0"),
            dumped.clone(),
            Bytes::from("b"),
            Bytes::from("5000"),
            dumped,
        ];
        assert_eq!(slotsrestore(server.ctx(), &mut s, &batch).unwrap(), Reply::ok());
        assert_eq!(s.db().strings().get(b"a").unwrap(), Some(Bytes::from("v")));
        assert_eq!(s.db().keys().ttl(b"a").unwrap(), -1);
        let ttl = s.db().keys().ttl(b"b").unwrap();
        assert!(ttl > 0 && ttl <= 5, "ttl {}", ttl);
    }

    #[test]
    fn test_restore_arity() {
        let server = TestServer::new();
        let mut s = server.session();
        assert!(matches!(
            slotsrestore(server.ctx(), &mut s, &args(&["a", "0"])),
            Err(XdisError::WrongArgCount(_))
        ));
        assert!(matches!(
            slotsrestore(server.ctx(), &mut s, &args(&["a", "x", "v"])),
            Err(XdisError::Value)
        ));
    }

    #[test]
    fn test_parse_target() {
        let target = parse_target("slotsmgrtone", &args(&["127.0.0.1", "6380", "0", "k"])).unwrap();
        assert_eq!(target.addr, "127.0.0.1:6380");
        assert_eq!(target.timeout, Duration::from_secs(1));
        assert!(matches!(
            parse_target("slotsmgrtone", &args(&["h", "6380", "-1", "k"])),
            Err(XdisError::Value)
        ));
        assert!(matches!(
            parse_target("slotsmgrtone", &args(&["h", "6380", "10"])),
            Err(XdisError::WrongArgCount(_))
        ));
    }

    #[tokio::test]
    async fn test_mgrtslot_unreachable() {
        let server = TestServer::new();
        let mut s = server.session();
        s.db().strings().set(b"foo", Bytes::from("1"), Default::default()).unwrap();
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port().to_string()
        };
        let err = slotsmgrtslot(server.ctx(), &mut s, &args(&["127.0.0.1", port.as_str(), "200", "918"]))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("IOERR"), "{}", err);
        assert_eq!(s.db().strings().get(b"foo").unwrap(), Some(Bytes::from("1")));
    }
}
