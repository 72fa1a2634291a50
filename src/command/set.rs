use super::{check_arity, check_exact, CmdCategory, CmdContext, CommandRegistry};
use crate::error::Result;
use crate::reply::Reply;
use crate::session::Session;
use crate::storage::SetOp;
use bytes::Bytes;

typed_key_commands!(sets: smclear, skeyexists, sexpire, sexpireat, sttl, spersist);

pub fn register(registry: &mut CommandRegistry) {
    let cat = CmdCategory::Set;
    registry.register_sync("sadd", cat, sadd);
    registry.register_sync("scard", cat, scard);
    registry.register_sync("sdiff", cat, sdiff);
    registry.register_sync("sdiffstore", cat, sdiffstore);
    registry.register_sync("sinter", cat, sinter);
    registry.register_sync("sinterstore", cat, sinterstore);
    registry.register_sync("sismember", cat, sismember);
    registry.register_sync("smembers", cat, smembers);
    registry.register_sync("srem", cat, srem);
    registry.register_sync("sunion", cat, sunion);
    registry.register_sync("sunionstore", cat, sunionstore);
    register_key_commands(registry, cat);
}

fn combine(cmd: &str, op: SetOp, s: &Session, args: &[Bytes]) -> Result<Reply> {
    check_arity(cmd, args, 1)?;
    Ok(Reply::bulks(s.db().sets().combine(op, args)?))
}

fn combine_store(cmd: &str, op: SetOp, s: &Session, args: &[Bytes]) -> Result<Reply> {
    check_arity(cmd, args, 2)?;
    Ok(Reply::Int(s.db().sets().combine_store(op, &args[0], &args[1..])?))
}

/// SADD key member [member ...]
fn sadd(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_arity("sadd", args, 2)?;
    Ok(Reply::Int(s.db().sets().sadd(&args[0], &args[1..])?))
}

/// SCARD key
fn scard(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("scard", args, 1)?;
    Ok(Reply::Int(s.db().sets().scard(&args[0])?))
}

/// SDIFF key [key ...]
fn sdiff(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    combine("sdiff", SetOp::Diff, s, args)
}

/// SDIFFSTORE destination key [key ...]
fn sdiffstore(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    combine_store("sdiffstore", SetOp::Diff, s, args)
}

/// SINTER key [key ...]
fn sinter(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    combine("sinter", SetOp::Inter, s, args)
}

/// SINTERSTORE destination key [key ...]
fn sinterstore(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    combine_store("sinterstore", SetOp::Inter, s, args)
}

/// SISMEMBER key member
fn sismember(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("sismember", args, 2)?;
    Ok(Reply::bool(s.db().sets().sismember(&args[0], &args[1])?))
}

/// SMEMBERS key
fn smembers(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("smembers", args, 1)?;
    Ok(Reply::bulks(s.db().sets().smembers(&args[0])?))
}

/// SREM key member [member ...]
fn srem(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_arity("srem", args, 2)?;
    Ok(Reply::Int(s.db().sets().srem(&args[0], &args[1..])?))
}

/// SUNION key [key ...]
fn sunion(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    combine("sunion", SetOp::Union, s, args)
}

/// SUNIONSTORE destination key [key ...]
fn sunionstore(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    combine_store("sunionstore", SetOp::Union, s, args)
}
