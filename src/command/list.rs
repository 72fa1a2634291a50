use super::{check_arity, check_exact, parse_i64, CmdCategory, CmdContext, CommandRegistry, HandlerFuture};
use crate::error::{Result, XdisError};
use crate::migrate::mover::{self, End};
use crate::reply::Reply;
use crate::session::Session;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

typed_key_commands!(lists: lmclear, lkeyexists, lexpire, lexpireat, lttl, lpersist);

pub fn register(registry: &mut CommandRegistry) {
    let cat = CmdCategory::List;
    registry.register_async("blpop", cat, blpop);
    registry.register_async("brpop", cat, brpop);
    registry.register_async("brpoplpush", cat, brpoplpush);
    registry.register_sync("lindex", cat, lindex);
    registry.register_sync("llen", cat, llen);
    registry.register_sync("lpop", cat, lpop);
    registry.register_sync("lpush", cat, lpush);
    registry.register_sync("lrange", cat, lrange);
    registry.register_sync("lset", cat, lset);
    registry.register_sync("rpop", cat, rpop);
    registry.register_sync("rpoplpush", cat, rpoplpush);
    registry.register_sync("rpush", cat, rpush);
    register_key_commands(registry, cat);
}

/// Blocking timeout in decimal seconds. `None` waits indefinitely.
fn parse_timeout(arg: &[u8]) -> Result<Option<Duration>> {
    let secs: f64 = std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| XdisError::InvalidArgument("timeout is not a float or out of range".to_string()))?;
    if secs < 0.0 {
        return Err(XdisError::InvalidArgument("timeout is negative".to_string()));
    }
    if secs == 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|_| XdisError::InvalidArgument("timeout is out of range".to_string()))
}

async fn blocking_pop(cmd: &str, s: &mut Session, args: &[Bytes], end: End) -> Result<Reply> {
    check_arity(cmd, args, 2)?;
    let (keys, timeout) = args.split_at(args.len() - 1);
    let timeout = parse_timeout(&timeout[0])?;
    let db = Arc::clone(s.db());
    match mover::blocking_pop(db.lists(), keys, end, timeout, s.close_signal()).await? {
        Some((key, value)) => Ok(Reply::bulks([key, value])),
        None => Ok(Reply::Nil),
    }
}

/// BLPOP key [key ...] timeout
fn blpop<'a>(_: CmdContext<'a>, s: &'a mut Session, args: &'a [Bytes]) -> HandlerFuture<'a> {
    Box::pin(blocking_pop("blpop", s, args, End::Head))
}

/// BRPOP key [key ...] timeout
fn brpop<'a>(_: CmdContext<'a>, s: &'a mut Session, args: &'a [Bytes]) -> HandlerFuture<'a> {
    Box::pin(blocking_pop("brpop", s, args, End::Tail))
}

/// BRPOPLPUSH source destination timeout
fn brpoplpush<'a>(_: CmdContext<'a>, s: &'a mut Session, args: &'a [Bytes]) -> HandlerFuture<'a> {
    Box::pin(async move {
        check_exact("brpoplpush", args, 3)?;
        let timeout = parse_timeout(&args[2])?;
        let db = Arc::clone(s.db());
        let moved = mover::blocking_move_tail_to_head(
            db.lists(),
            &args[0],
            &args[1],
            timeout,
            s.close_signal(),
        )
        .await?;
        Ok(Reply::opt_bulk(moved))
    })
}

/// LINDEX key index
fn lindex(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("lindex", args, 2)?;
    let index = parse_i64(&args[1])?;
    Ok(Reply::opt_bulk(s.db().lists().lindex(&args[0], index)?))
}

/// LLEN key
fn llen(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("llen", args, 1)?;
    Ok(Reply::Int(s.db().lists().llen(&args[0])?))
}

/// LPOP key
fn lpop(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("lpop", args, 1)?;
    Ok(Reply::opt_bulk(s.db().lists().lpop(&args[0])?))
}

/// LPUSH key value [value ...]
fn lpush(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_arity("lpush", args, 2)?;
    Ok(Reply::Int(s.db().lists().lpush(&args[0], &args[1..])?))
}

/// LRANGE key start stop
fn lrange(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("lrange", args, 3)?;
    let start = parse_i64(&args[1])?;
    let stop = parse_i64(&args[2])?;
    Ok(Reply::bulks(s.db().lists().lrange(&args[0], start, stop)?))
}

/// LSET key index value
fn lset(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("lset", args, 3)?;
    let index = parse_i64(&args[1])?;
    s.db().lists().lset(&args[0], index, args[2].clone())?;
    Ok(Reply::ok())
}

/// RPOP key
fn rpop(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("rpop", args, 1)?;
    Ok(Reply::opt_bulk(s.db().lists().rpop(&args[0])?))
}

/// RPOPLPUSH source destination
fn rpoplpush(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("rpoplpush", args, 2)?;
    let moved = mover::move_tail_to_head(s.db().lists(), &args[0], &args[1])?;
    Ok(Reply::opt_bulk(moved))
}

/// RPUSH key value [value ...]
fn rpush(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_arity("rpush", args, 2)?;
    Ok(Reply::Int(s.db().lists().rpush(&args[0], &args[1..])?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::test_support::{args, TestServer};
    use std::time::Instant;

    #[test]
    fn test_push_pop_range() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(
            rpush(server.ctx(), &mut s, &args(&["l", "a", "b", "c"])).unwrap(),
            Reply::Int(3)
        );
        assert_eq!(
            lpush(server.ctx(), &mut s, &args(&["l", "z"])).unwrap(),
            Reply::Int(4)
        );
        assert_eq!(
            lrange(server.ctx(), &mut s, &args(&["l", "0", "-1"])).unwrap(),
            Reply::bulks(args(&["z", "a", "b", "c"]))
        );
        assert_eq!(
            lindex(server.ctx(), &mut s, &args(&["l", "-1"])).unwrap(),
            Reply::bulk("c")
        );
        assert_eq!(lpop(server.ctx(), &mut s, &args(&["l"])).unwrap(), Reply::bulk("z"));
        assert_eq!(rpop(server.ctx(), &mut s, &args(&["l"])).unwrap(), Reply::bulk("c"));
        assert_eq!(llen(server.ctx(), &mut s, &args(&["l"])).unwrap(), Reply::Int(2));
        assert_eq!(rpop(server.ctx(), &mut s, &args(&["none"])).unwrap(), Reply::Nil);
    }

    #[test]
    fn test_lset_errors() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(
            lset(server.ctx(), &mut s, &args(&["l", "0", "x"]))
                .unwrap_err()
                .to_string(),
            "ERR no such key"
        );
        rpush(server.ctx(), &mut s, &args(&["l", "a"])).unwrap();
        assert_eq!(
            lset(server.ctx(), &mut s, &args(&["l", "5", "x"]))
                .unwrap_err()
                .to_string(),
            "ERR index out of range"
        );
        assert_eq!(lset(server.ctx(), &mut s, &args(&["l", "0", "x"])).unwrap(), Reply::ok());
    }

    #[test]
    fn test_rpoplpush_rotates_and_keeps_ttl() {
        let server = TestServer::new();
        let mut s = server.session();
        rpush(server.ctx(), &mut s, &args(&["k", "v"])).unwrap();
        lexpire(server.ctx(), &mut s, &args(&["k", "100"])).unwrap();
        assert_eq!(
            rpoplpush(server.ctx(), &mut s, &args(&["k", "k"])).unwrap(),
            Reply::bulk("v")
        );
        match lttl(server.ctx(), &mut s, &args(&["k"])).unwrap() {
            Reply::Int(ttl) => assert!(ttl > 0 && ttl <= 100, "ttl {}", ttl),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            rpoplpush(server.ctx(), &mut s, &args(&["missing", "k"])).unwrap(),
            Reply::Nil
        );
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout(b"0").unwrap(), None);
        assert_eq!(
            parse_timeout(b"0.25").unwrap(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            parse_timeout(b"-1").unwrap_err().to_string(),
            "ERR timeout is negative"
        );
        assert!(parse_timeout(b"soon").is_err());
        assert!(parse_timeout(b"inf").is_err());
        assert_eq!(
            parse_timeout(b"1e300").unwrap_err().to_string(),
            "ERR timeout is out of range"
        );
        assert!(parse_timeout(b"1e19").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_huge_timeouts_do_not_panic() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(
            blpop(server.ctx(), &mut s, &args(&["k", "1e300"]))
                .await
                .unwrap_err()
                .to_string(),
            "ERR timeout is out of range"
        );

        // Too far out for a deadline: waits until an element arrives.
        rpush(server.ctx(), &mut s, &args(&["a", "x"])).unwrap();
        assert_eq!(
            brpoplpush(server.ctx(), &mut s, &args(&["a", "b", "1e19"]))
                .await
                .unwrap(),
            Reply::bulk("x")
        );
        let db = Arc::clone(s.db());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            db.lists().rpush(b"a", &[Bytes::from_static(b"y")]).unwrap();
        });
        assert_eq!(
            brpoplpush(server.ctx(), &mut s, &args(&["a", "b", "1e19"]))
                .await
                .unwrap(),
            Reply::bulk("y")
        );
    }

    #[tokio::test]
    async fn test_blpop_missing_key_times_out() {
        let server = TestServer::new();
        let mut s = server.session();
        let start = Instant::now();
        let reply = blpop(server.ctx(), &mut s, &args(&["missingkey", "0.1"]))
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert_eq!(reply, Reply::Nil);
        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_brpop_returns_key_and_value() {
        let server = TestServer::new();
        let mut s = server.session();
        rpush(server.ctx(), &mut s, &args(&["b", "1", "2"])).unwrap();
        let reply = brpop(server.ctx(), &mut s, &args(&["a", "b", "1"]))
            .await
            .unwrap();
        assert_eq!(reply, Reply::bulks(args(&["b", "2"])));
    }

    #[tokio::test]
    async fn test_brpoplpush_wakes_on_push() {
        let server = TestServer::new();
        let mut s = server.session();
        let db = Arc::clone(s.db());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            db.lists().rpush(b"src", &[Bytes::from_static(b"x")]).unwrap();
        });
        let reply = brpoplpush(server.ctx(), &mut s, &args(&["src", "dst", "5"]))
            .await
            .unwrap();
        assert_eq!(reply, Reply::bulk("x"));
        assert_eq!(
            lrange(server.ctx(), &mut s, &args(&["dst", "0", "-1"])).unwrap(),
            Reply::bulks(args(&["x"]))
        );
    }

    #[tokio::test]
    async fn test_blocking_pop_arity() {
        let server = TestServer::new();
        let mut s = server.session();
        assert!(matches!(
            blpop(server.ctx(), &mut s, &args(&["0"])).await,
            Err(XdisError::WrongArgCount(_))
        ));
    }
}
