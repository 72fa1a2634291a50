use super::{check_arity, check_exact, pairs, parse_i64, CmdCategory, CmdContext, CommandRegistry};
use crate::error::{Result, XdisError};
use crate::reply::Reply;
use crate::session::Session;
use bytes::Bytes;

typed_key_commands!(hashes: hmclear, hkeyexists, hexpire, hexpireat, httl, hpersist);

pub fn register(registry: &mut CommandRegistry) {
    let cat = CmdCategory::Hash;
    registry.register_sync("hdel", cat, hdel);
    registry.register_sync("hexists", cat, hexists);
    registry.register_sync("hget", cat, hget);
    registry.register_sync("hgetall", cat, hgetall);
    registry.register_sync("hincrby", cat, hincrby);
    registry.register_sync("hkeys", cat, hkeys);
    registry.register_sync("hlen", cat, hlen);
    registry.register_sync("hmget", cat, hmget);
    registry.register_sync("hmset", cat, hmset);
    registry.register_sync("hset", cat, hset);
    registry.register_sync("hvals", cat, hvals);
    register_key_commands(registry, cat);
}

/// Field/value pairs after the key; at least one pair, no dangling field.
fn field_pairs(cmd: &str, args: &[Bytes]) -> Result<Vec<(Bytes, Bytes)>> {
    if args.len() < 3 || (args.len() - 1) % 2 != 0 {
        return Err(XdisError::WrongArgCount(cmd.to_string()));
    }
    Ok(pairs(&args[1..]))
}

/// HDEL key field [field ...]
fn hdel(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_arity("hdel", args, 2)?;
    Ok(Reply::Int(s.db().hashes().hdel(&args[0], &args[1..])?))
}

/// HEXISTS key field
fn hexists(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("hexists", args, 2)?;
    Ok(Reply::bool(s.db().hashes().hget(&args[0], &args[1])?.is_some()))
}

/// HGET key field
fn hget(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("hget", args, 2)?;
    Ok(Reply::opt_bulk(s.db().hashes().hget(&args[0], &args[1])?))
}

/// HGETALL key
/// Flattened field/value array.
fn hgetall(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("hgetall", args, 1)?;
    let all = s.db().hashes().hgetall(&args[0])?;
    Ok(Reply::bulks(all.into_iter().flat_map(|(f, v)| [f, v])))
}

/// HINCRBY key field increment
fn hincrby(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("hincrby", args, 3)?;
    let delta = parse_i64(&args[2])?;
    Ok(Reply::Int(
        s.db().hashes().hincr_by(&args[0], &args[1], delta)?,
    ))
}

/// HKEYS key
fn hkeys(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("hkeys", args, 1)?;
    Ok(Reply::bulks(s.db().hashes().hkeys(&args[0])?))
}

/// HLEN key
fn hlen(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("hlen", args, 1)?;
    Ok(Reply::Int(s.db().hashes().hlen(&args[0])?))
}

/// HMGET key field [field ...]
fn hmget(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_arity("hmget", args, 2)?;
    let values = s.db().hashes().hmget(&args[0], &args[1..])?;
    Ok(Reply::Array(values.into_iter().map(Reply::opt_bulk).collect()))
}

/// HMSET key field value [field value ...]
fn hmset(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    let pairs = field_pairs("hmset", args)?;
    s.db().hashes().hset(&args[0], &pairs)?;
    Ok(Reply::ok())
}

/// HSET key field value [field value ...]
/// Returns the number of fields created.
fn hset(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    let pairs = field_pairs("hset", args)?;
    Ok(Reply::Int(s.db().hashes().hset(&args[0], &pairs)?))
}

/// HVALS key
fn hvals(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("hvals", args, 1)?;
    Ok(Reply::bulks(s.db().hashes().hvals(&args[0])?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::test_support::{args, TestServer};

    #[test]
    fn test_hset_hget_hgetall() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(
            hset(server.ctx(), &mut s, &args(&["h", "a", "1", "b", "2"])).unwrap(),
            Reply::Int(2)
        );
        assert_eq!(
            hset(server.ctx(), &mut s, &args(&["h", "a", "3"])).unwrap(),
            Reply::Int(0)
        );
        assert_eq!(
            hget(server.ctx(), &mut s, &args(&["h", "a"])).unwrap(),
            Reply::bulk("3")
        );
        assert_eq!(
            hgetall(server.ctx(), &mut s, &args(&["h"])).unwrap(),
            Reply::bulks(args(&["a", "3", "b", "2"]))
        );
    }

    #[test]
    fn test_hset_dangling_field() {
        let server = TestServer::new();
        let mut s = server.session();
        assert!(matches!(
            hset(server.ctx(), &mut s, &args(&["h", "a", "1", "b"])),
            Err(XdisError::WrongArgCount(_))
        ));
    }

    #[test]
    fn test_hincrby_and_hdel() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(
            hincrby(server.ctx(), &mut s, &args(&["h", "n", "5"])).unwrap(),
            Reply::Int(5)
        );
        assert_eq!(
            hincrby(server.ctx(), &mut s, &args(&["h", "n", "-7"])).unwrap(),
            Reply::Int(-2)
        );
        assert_eq!(
            hdel(server.ctx(), &mut s, &args(&["h", "n", "zz"])).unwrap(),
            Reply::Int(1)
        );
        assert_eq!(hlen(server.ctx(), &mut s, &args(&["h"])).unwrap(), Reply::Int(0));
    }

    #[test]
    fn test_typed_ttl_commands() {
        let server = TestServer::new();
        let mut s = server.session();
        hset(server.ctx(), &mut s, &args(&["h", "a", "1"])).unwrap();
        assert_eq!(httl(server.ctx(), &mut s, &args(&["h"])).unwrap(), Reply::Int(-1));
        assert_eq!(
            hexpire(server.ctx(), &mut s, &args(&["h", "50"])).unwrap(),
            Reply::Int(1)
        );
        assert_eq!(httl(server.ctx(), &mut s, &args(&["h"])).unwrap(), Reply::Int(50));
        assert_eq!(hpersist(server.ctx(), &mut s, &args(&["h"])).unwrap(), Reply::Int(1));
        assert_eq!(
            hkeyexists(server.ctx(), &mut s, &args(&["h"])).unwrap(),
            Reply::Int(1)
        );
        assert_eq!(hmclear(server.ctx(), &mut s, &args(&["h"])).unwrap(), Reply::Int(1));
        assert_eq!(httl(server.ctx(), &mut s, &args(&["h"])).unwrap(), Reply::Int(-2));
    }
}
