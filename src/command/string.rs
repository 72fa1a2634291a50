use super::{check_arity, check_exact, lower, pairs, parse_i64, CmdCategory, CmdContext, CommandRegistry};
use crate::error::{Result, XdisError};
use crate::reply::Reply;
use crate::session::Session;
use crate::storage::{SetCondition, SetOptions};
use bytes::Bytes;

// Plain key management acts on keys of any type.
typed_key_commands!(keys: del, exists, expire, expireat, ttl, persist);

pub fn register(registry: &mut CommandRegistry) {
    let cat = CmdCategory::String;
    registry.register_sync("append", cat, append);
    registry.register_sync("decr", cat, decr);
    registry.register_sync("decrby", cat, decrby);
    registry.register_sync("get", cat, get);
    registry.register_sync("getrange", cat, getrange);
    registry.register_sync("getset", cat, getset);
    registry.register_sync("incr", cat, incr);
    registry.register_sync("incrby", cat, incrby);
    registry.register_sync("mget", cat, mget);
    registry.register_sync("mset", cat, mset);
    registry.register_sync("set", cat, set);
    registry.register_sync("setnx", cat, setnx);
    registry.register_sync("setex", cat, setex);
    registry.register_sync("setnxex", cat, setnxex);
    registry.register_sync("setxxex", cat, setxxex);
    registry.register_sync("setrange", cat, setrange);
    registry.register_sync("strlen", cat, strlen);
    register_key_commands(registry, cat);
}

fn invalid_expire(cmd: &str) -> XdisError {
    XdisError::InvalidArgument(format!("invalid expire time in '{}' command", cmd))
}

/// Seconds argument of the `SETEX` family, as milliseconds.
fn expire_seconds(cmd: &str, arg: &[u8]) -> Result<i64> {
    let seconds = parse_i64(arg)?;
    if seconds <= 0 {
        return Err(invalid_expire(cmd));
    }
    seconds.checked_mul(1000).ok_or_else(|| invalid_expire(cmd))
}

/// APPEND key value
fn append(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("append", args, 2)?;
    Ok(Reply::Int(s.db().strings().append(&args[0], &args[1])?))
}

/// DECR key
fn decr(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("decr", args, 1)?;
    Ok(Reply::Int(s.db().strings().incr_by(&args[0], -1)?))
}

/// DECRBY key decrement
fn decrby(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("decrby", args, 2)?;
    let delta = parse_i64(&args[1])?.checked_neg().ok_or(XdisError::Value)?;
    Ok(Reply::Int(s.db().strings().incr_by(&args[0], delta)?))
}

/// GET key
fn get(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("get", args, 1)?;
    Ok(Reply::opt_bulk(s.db().strings().get(&args[0])?))
}

/// GETRANGE key start end
fn getrange(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("getrange", args, 3)?;
    let start = parse_i64(&args[1])?;
    let end = parse_i64(&args[2])?;
    Ok(Reply::Bulk(s.db().strings().get_range(&args[0], start, end)?))
}

/// GETSET key value
fn getset(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("getset", args, 2)?;
    Ok(Reply::opt_bulk(
        s.db().strings().get_set(&args[0], args[1].clone())?,
    ))
}

/// INCR key
fn incr(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("incr", args, 1)?;
    Ok(Reply::Int(s.db().strings().incr_by(&args[0], 1)?))
}

/// INCRBY key increment
fn incrby(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("incrby", args, 2)?;
    let delta = parse_i64(&args[1])?;
    Ok(Reply::Int(s.db().strings().incr_by(&args[0], delta)?))
}

/// MGET key [key ...]
fn mget(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_arity("mget", args, 1)?;
    let values = s.db().strings().mget(args)?;
    Ok(Reply::Array(values.into_iter().map(Reply::opt_bulk).collect()))
}

/// MSET key value [key value ...]
fn mset(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    if args.is_empty() || args.len() % 2 != 0 {
        return Err(XdisError::WrongArgCount("mset".to_string()));
    }
    s.db().strings().mset(&pairs(args))?;
    Ok(Reply::ok())
}

/// SET key value [EX seconds | PX milliseconds] [NX | XX]
fn set(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_arity("set", args, 2)?;

    let mut opts = SetOptions::default();
    let mut i = 2;
    while i < args.len() {
        match lower(&args[i]).as_str() {
            "ex" | "px" if opts.expire_ms.is_none() && i + 1 < args.len() => {
                let unit = if lower(&args[i]) == "ex" { 1000 } else { 1 };
                let n = parse_i64(&args[i + 1])?;
                if n <= 0 {
                    return Err(invalid_expire("set"));
                }
                opts.expire_ms = Some(n.checked_mul(unit).ok_or_else(|| invalid_expire("set"))?);
                i += 2;
            }
            "nx" if opts.condition == SetCondition::Always => {
                opts.condition = SetCondition::IfAbsent;
                i += 1;
            }
            "xx" if opts.condition == SetCondition::Always => {
                opts.condition = SetCondition::IfPresent;
                i += 1;
            }
            _ => return Err(XdisError::Syntax),
        }
    }

    if s.db().strings().set(&args[0], args[1].clone(), opts)? {
        Ok(Reply::ok())
    } else {
        Ok(Reply::Nil)
    }
}

/// SETNX key value
fn setnx(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("setnx", args, 2)?;
    let opts = SetOptions {
        expire_ms: None,
        condition: SetCondition::IfAbsent,
    };
    Ok(Reply::bool(s.db().strings().set(&args[0], args[1].clone(), opts)?))
}

/// SETEX key seconds value
fn setex(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("setex", args, 3)?;
    let opts = SetOptions {
        expire_ms: Some(expire_seconds("setex", &args[1])?),
        condition: SetCondition::Always,
    };
    s.db().strings().set(&args[0], args[2].clone(), opts)?;
    Ok(Reply::ok())
}

/// SETNXEX key seconds value
/// Set with expiry only when the key does not exist.
fn setnxex(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("setnxex", args, 3)?;
    let opts = SetOptions {
        expire_ms: Some(expire_seconds("setnxex", &args[1])?),
        condition: SetCondition::IfAbsent,
    };
    Ok(Reply::bool(s.db().strings().set(&args[0], args[2].clone(), opts)?))
}

/// SETXXEX key seconds value
/// Set with expiry only when the key already exists.
fn setxxex(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("setxxex", args, 3)?;
    let opts = SetOptions {
        expire_ms: Some(expire_seconds("setxxex", &args[1])?),
        condition: SetCondition::IfPresent,
    };
    Ok(Reply::bool(s.db().strings().set(&args[0], args[2].clone(), opts)?))
}

/// SETRANGE key offset value
fn setrange(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("setrange", args, 3)?;
    let offset = parse_i64(&args[1])?;
    if offset < 0 {
        return Err(XdisError::InvalidArgument("offset is out of range".to_string()));
    }
    Ok(Reply::Int(
        s.db()
            .strings()
            .set_range(&args[0], offset as usize, &args[2])?,
    ))
}

/// STRLEN key
fn strlen(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("strlen", args, 1)?;
    Ok(Reply::Int(s.db().strings().strlen(&args[0])?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::test_support::{args, TestServer};

    #[test]
    fn test_set_get() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(set(server.ctx(), &mut s, &args(&["k", "v"])).unwrap(), Reply::ok());
        assert_eq!(get(server.ctx(), &mut s, &args(&["k"])).unwrap(), Reply::bulk("v"));
        assert_eq!(get(server.ctx(), &mut s, &args(&["nope"])).unwrap(), Reply::Nil);
    }

    #[test]
    fn test_set_options() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(
            set(server.ctx(), &mut s, &args(&["k", "v", "XX"])).unwrap(),
            Reply::Nil
        );
        assert_eq!(
            set(server.ctx(), &mut s, &args(&["k", "v", "nx", "ex", "10"])).unwrap(),
            Reply::ok()
        );
        assert_eq!(ttl(server.ctx(), &mut s, &args(&["k"])).unwrap(), Reply::Int(10));
        assert!(matches!(
            set(server.ctx(), &mut s, &args(&["k", "v", "ex", "0"])),
            Err(XdisError::InvalidArgument(_))
        ));
        assert!(matches!(
            set(server.ctx(), &mut s, &args(&["k", "v", "bogus"])),
            Err(XdisError::Syntax)
        ));
    }

    #[test]
    fn test_setnxex_and_setxxex() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(
            setxxex(server.ctx(), &mut s, &args(&["k", "5", "v"])).unwrap(),
            Reply::Int(0)
        );
        assert_eq!(
            setnxex(server.ctx(), &mut s, &args(&["k", "5", "v"])).unwrap(),
            Reply::Int(1)
        );
        assert_eq!(
            setnxex(server.ctx(), &mut s, &args(&["k", "5", "w"])).unwrap(),
            Reply::Int(0)
        );
        assert_eq!(
            setxxex(server.ctx(), &mut s, &args(&["k", "9", "w"])).unwrap(),
            Reply::Int(1)
        );
        assert_eq!(get(server.ctx(), &mut s, &args(&["k"])).unwrap(), Reply::bulk("w"));
    }

    #[test]
    fn test_counters() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(incr(server.ctx(), &mut s, &args(&["n"])).unwrap(), Reply::Int(1));
        assert_eq!(
            incrby(server.ctx(), &mut s, &args(&["n", "10"])).unwrap(),
            Reply::Int(11)
        );
        assert_eq!(
            decrby(server.ctx(), &mut s, &args(&["n", "20"])).unwrap(),
            Reply::Int(-9)
        );
        assert!(matches!(
            incrby(server.ctx(), &mut s, &args(&["n", "x"])),
            Err(XdisError::Value)
        ));
    }

    #[test]
    fn test_ranges() {
        let server = TestServer::new();
        let mut s = server.session();
        set(server.ctx(), &mut s, &args(&["k", "Hello World"])).unwrap();
        assert_eq!(
            getrange(server.ctx(), &mut s, &args(&["k", "-5", "-1"])).unwrap(),
            Reply::bulk("World")
        );
        assert_eq!(
            setrange(server.ctx(), &mut s, &args(&["k", "6", "Redis"])).unwrap(),
            Reply::Int(11)
        );
        assert_eq!(
            setrange(server.ctx(), &mut s, &args(&["pad", "3", "x"])).unwrap(),
            Reply::Int(4)
        );
        assert_eq!(
            get(server.ctx(), &mut s, &args(&["pad"])).unwrap(),
            Reply::bulk(Bytes::from_static(b"\0\0\0x"))
        );
    }

    #[test]
    fn test_mset_mget_arity() {
        let server = TestServer::new();
        let mut s = server.session();
        assert!(matches!(
            mset(server.ctx(), &mut s, &args(&["a", "1", "b"])),
            Err(XdisError::WrongArgCount(_))
        ));
        mset(server.ctx(), &mut s, &args(&["a", "1", "b", "2"])).unwrap();
        assert_eq!(
            mget(server.ctx(), &mut s, &args(&["a", "x", "b"])).unwrap(),
            Reply::Array(vec![Reply::bulk("1"), Reply::Nil, Reply::bulk("2")])
        );
    }

    #[test]
    fn test_generic_key_commands_span_types() {
        let server = TestServer::new();
        let mut s = server.session();
        s.db().lists().rpush(b"l", &args(&["a"])).unwrap();
        assert_eq!(exists(server.ctx(), &mut s, &args(&["l"])).unwrap(), Reply::Int(1));
        assert_eq!(
            expire(server.ctx(), &mut s, &args(&["l", "30"])).unwrap(),
            Reply::Int(1)
        );
        assert_eq!(del(server.ctx(), &mut s, &args(&["l", "nope"])).unwrap(), Reply::Int(1));
    }
}
