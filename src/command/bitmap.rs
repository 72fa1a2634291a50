use super::{check_arity, check_exact, lower, parse_i64, CmdCategory, CmdContext, CommandRegistry};
use crate::error::{Result, XdisError};
use crate::reply::Reply;
use crate::session::Session;
use crate::storage::BitOp;
use bytes::Bytes;

/// Bit offsets address at most a 512MB string.
const MAX_BIT_OFFSET: u64 = 1 << 32;

pub fn register(registry: &mut CommandRegistry) {
    let cat = CmdCategory::Bitmap;
    registry.register_sync("bitcount", cat, bitcount);
    registry.register_sync("bitop", cat, bitop);
    registry.register_sync("bitpos", cat, bitpos);
    registry.register_sync("getbit", cat, getbit);
    registry.register_sync("setbit", cat, setbit);
}

fn parse_offset(arg: &[u8]) -> Result<u64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|o| *o < MAX_BIT_OFFSET)
        .ok_or_else(|| {
            XdisError::InvalidArgument("bit offset is not an integer or out of range".to_string())
        })
}

fn parse_bit(arg: &[u8]) -> Result<u8> {
    match arg {
        b"0" => Ok(0),
        b"1" => Ok(1),
        _ => Err(XdisError::InvalidArgument(
            "bit is not an integer or out of range".to_string(),
        )),
    }
}

/// BITCOUNT key [start end]
fn bitcount(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    let (start, end) = match args.len() {
        1 => (0, -1),
        3 => (parse_i64(&args[1])?, parse_i64(&args[2])?),
        2 => return Err(XdisError::Syntax),
        _ => return Err(XdisError::WrongArgCount("bitcount".to_string())),
    };
    Ok(Reply::Int(s.db().bitmaps().bitcount(&args[0], start, end)?))
}

/// BITOP AND|OR|XOR|NOT destkey key [key ...]
fn bitop(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_arity("bitop", args, 3)?;
    let op = match lower(&args[0]).as_str() {
        "and" => BitOp::And,
        "or" => BitOp::Or,
        "xor" => BitOp::Xor,
        "not" => BitOp::Not,
        _ => return Err(XdisError::Syntax),
    };
    Ok(Reply::Int(s.db().bitmaps().bitop(op, &args[1], &args[2..])?))
}

/// BITPOS key bit [start [end]]
fn bitpos(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    if args.len() < 2 || args.len() > 4 {
        return Err(XdisError::WrongArgCount("bitpos".to_string()));
    }
    let bit = match &args[1][..] {
        b"0" => 0,
        b"1" => 1,
        _ => {
            return Err(XdisError::InvalidArgument(
                "The bit argument must be 1 or 0.".to_string(),
            ))
        }
    };
    let start = args.get(2).map(|a| parse_i64(a)).transpose()?.unwrap_or(0);
    let end = args.get(3).map(|a| parse_i64(a)).transpose()?;
    Ok(Reply::Int(s.db().bitmaps().bitpos(&args[0], bit, start, end)?))
}

/// GETBIT key offset
fn getbit(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("getbit", args, 2)?;
    let offset = parse_offset(&args[1])?;
    Ok(Reply::Int(s.db().bitmaps().getbit(&args[0], offset)?))
}

/// SETBIT key offset value
fn setbit(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("setbit", args, 3)?;
    let offset = parse_offset(&args[1])?;
    let on = parse_bit(&args[2])? == 1;
    Ok(Reply::Int(s.db().bitmaps().setbit(&args[0], offset, on)?))
}
