use super::{check_arity, check_exact, lower, parse_i64, CmdCategory, CmdContext, CommandRegistry};
use crate::error::{Result, XdisError};
use crate::reply::Reply;
use crate::session::Session;
use crate::storage::{Aggregate, LexBound, Limit, ScorePair, ZSetOp};
use bytes::Bytes;

typed_key_commands!(zsets: zmclear, zkeyexists, zexpire, zexpireat, zttl, zpersist);

pub fn register(registry: &mut CommandRegistry) {
    let cat = CmdCategory::ZSet;
    registry.register_sync("zadd", cat, zadd);
    registry.register_sync("zcard", cat, zcard);
    registry.register_sync("zcount", cat, zcount);
    registry.register_sync("zincrby", cat, zincrby);
    registry.register_sync("zinterstore", cat, zinterstore);
    registry.register_sync("zlexcount", cat, zlexcount);
    registry.register_sync("zrange", cat, zrange);
    registry.register_sync("zrangebylex", cat, zrangebylex);
    registry.register_sync("zrangebyscore", cat, zrangebyscore);
    registry.register_sync("zrank", cat, zrank);
    registry.register_sync("zrem", cat, zrem);
    registry.register_sync("zremrangebylex", cat, zremrangebylex);
    registry.register_sync("zremrangebyrank", cat, zremrangebyrank);
    registry.register_sync("zremrangebyscore", cat, zremrangebyscore);
    registry.register_sync("zrevrange", cat, zrevrange);
    registry.register_sync("zrevrangebyscore", cat, zrevrangebyscore);
    registry.register_sync("zrevrank", cat, zrevrank);
    registry.register_sync("zscore", cat, zscore);
    registry.register_sync("zunionstore", cat, zunionstore);
    register_key_commands(registry, cat);
}

fn int_bulk(n: i64) -> Reply {
    Reply::Bulk(Bytes::from(n.to_string()))
}

fn pairs_reply(pairs: Vec<ScorePair>, with_scores: bool) -> Reply {
    if !with_scores {
        return Reply::bulks(pairs.into_iter().map(|p| p.member));
    }
    let mut out = Vec::with_capacity(pairs.len() * 2);
    for p in pairs {
        out.push(Reply::Bulk(p.member));
        out.push(int_bulk(p.score));
    }
    Reply::Array(out)
}

/// Score bound: `-inf`, `+inf`, `n`, or exclusive `(n`. Returns the value
/// and whether it is exclusive.
fn parse_score_bound(arg: &[u8]) -> Result<(i64, bool)> {
    let (exclusive, raw) = match arg.split_first() {
        Some((b'(', rest)) => (true, rest),
        _ => (false, arg),
    };
    let value = match lower(raw).as_str() {
        "-inf" => i64::MIN,
        "+inf" | "inf" => i64::MAX,
        _ => parse_i64(raw)?,
    };
    Ok((value, exclusive))
}

/// Inclusive integer range for a `min max` pair of score bounds.
fn score_range(min: &[u8], max: &[u8]) -> Result<(i64, i64)> {
    let (lo, lo_exclusive) = parse_score_bound(min)?;
    let (hi, hi_exclusive) = parse_score_bound(max)?;
    let lo = if lo_exclusive { lo.saturating_add(1) } else { lo };
    let hi = if hi_exclusive { hi.saturating_sub(1) } else { hi };
    Ok((lo, hi))
}

fn parse_lex_bound(arg: &[u8]) -> Result<LexBound> {
    match arg.split_first() {
        Some((b'-', [])) | Some((b'+', [])) => Ok(LexBound::Unbounded),
        Some((b'[', rest)) => Ok(LexBound::Inclusive(Bytes::copy_from_slice(rest))),
        Some((b'(', rest)) => Ok(LexBound::Exclusive(Bytes::copy_from_slice(rest))),
        _ => Err(XdisError::InvalidArgument(
            "min or max not valid string range item".to_string(),
        )),
    }
}

fn parse_limit(offset: &[u8], count: &[u8]) -> Result<Limit> {
    Ok(Limit {
        offset: parse_i64(offset)?,
        count: parse_i64(count)?,
    })
}

/// ZADD key score member [score member ...]
fn zadd(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    if args.len() < 3 || (args.len() - 1) % 2 != 0 {
        return Err(XdisError::WrongArgCount("zadd".to_string()));
    }
    let pairs = args[1..]
        .chunks_exact(2)
        .map(|c| {
            Ok(ScorePair {
                score: parse_i64(&c[0])?,
                member: c[1].clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Reply::Int(s.db().zsets().zadd(&args[0], &pairs)?))
}

/// ZCARD key
fn zcard(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("zcard", args, 1)?;
    Ok(Reply::Int(s.db().zsets().zcard(&args[0])?))
}

/// ZCOUNT key min max
fn zcount(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("zcount", args, 3)?;
    let (min, max) = score_range(&args[1], &args[2])?;
    Ok(Reply::Int(s.db().zsets().zcount(&args[0], min, max)?))
}

/// ZINCRBY key increment member
fn zincrby(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("zincrby", args, 3)?;
    let delta = parse_i64(&args[1])?;
    Ok(int_bulk(s.db().zsets().zincr_by(&args[0], delta, &args[2])?))
}

fn zstore(cmd: &str, op: ZSetOp, s: &Session, args: &[Bytes]) -> Result<Reply> {
    check_arity(cmd, args, 3)?;
    let dest = &args[0];
    let numkeys = parse_i64(&args[1])?;
    if numkeys <= 0 {
        return Err(XdisError::InvalidArgument(format!(
            "at least 1 input key is needed for {}",
            cmd.to_ascii_uppercase()
        )));
    }
    let numkeys = numkeys as usize;
    if args.len() < 2 + numkeys {
        return Err(XdisError::Syntax);
    }
    let keys = &args[2..2 + numkeys];

    let mut weights: Option<Vec<i64>> = None;
    let mut aggregate: Option<Aggregate> = None;
    let mut rest = &args[2 + numkeys..];
    while let Some((opt, tail)) = rest.split_first() {
        match lower(opt).as_str() {
            "weights" if weights.is_none() => {
                if tail.len() < numkeys {
                    return Err(XdisError::Syntax);
                }
                let parsed = tail[..numkeys]
                    .iter()
                    .map(|w| parse_i64(w))
                    .collect::<Result<Vec<_>>>()?;
                weights = Some(parsed);
                rest = &tail[numkeys..];
            }
            "aggregate" if aggregate.is_none() => {
                let (name, tail) = tail.split_first().ok_or(XdisError::Syntax)?;
                aggregate = Some(match lower(name).as_str() {
                    "sum" => Aggregate::Sum,
                    "min" => Aggregate::Min,
                    "max" => Aggregate::Max,
                    _ => return Err(XdisError::Syntax),
                });
                rest = tail;
            }
            _ => return Err(XdisError::Syntax),
        }
    }

    let n = s.db().zsets().zstore(
        op,
        dest,
        keys,
        weights.as_deref(),
        aggregate.unwrap_or_default(),
    )?;
    Ok(Reply::Int(n))
}

/// ZINTERSTORE destination numkeys key [key ...] [WEIGHTS w ...] [AGGREGATE SUM|MIN|MAX]
fn zinterstore(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    zstore("zinterstore", ZSetOp::Inter, s, args)
}

/// ZUNIONSTORE destination numkeys key [key ...] [WEIGHTS w ...] [AGGREGATE SUM|MIN|MAX]
fn zunionstore(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    zstore("zunionstore", ZSetOp::Union, s, args)
}

/// ZLEXCOUNT key min max
fn zlexcount(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("zlexcount", args, 3)?;
    let min = parse_lex_bound(&args[1])?;
    let max = parse_lex_bound(&args[2])?;
    Ok(Reply::Int(s.db().zsets().zlex_count(&args[0], &min, &max)?))
}

fn range_by_rank(cmd: &str, reverse: bool, s: &Session, args: &[Bytes]) -> Result<Reply> {
    if args.len() != 3 && args.len() != 4 {
        return Err(XdisError::WrongArgCount(cmd.to_string()));
    }
    let with_scores = match args.get(3) {
        None => false,
        Some(opt) if lower(opt) == "withscores" => true,
        Some(_) => return Err(XdisError::Syntax),
    };
    let start = parse_i64(&args[1])?;
    let stop = parse_i64(&args[2])?;
    let pairs = s.db().zsets().zrange(&args[0], start, stop, reverse)?;
    Ok(pairs_reply(pairs, with_scores))
}

/// ZRANGE key start stop [WITHSCORES]
fn zrange(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    range_by_rank("zrange", false, s, args)
}

/// ZREVRANGE key start stop [WITHSCORES]
fn zrevrange(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    range_by_rank("zrevrange", true, s, args)
}

/// Shared by both score-range directions; the reverse form takes `max min`.
fn range_by_score(cmd: &str, reverse: bool, s: &Session, args: &[Bytes]) -> Result<Reply> {
    check_arity(cmd, args, 3)?;
    let (min_arg, max_arg) = if reverse {
        (&args[2], &args[1])
    } else {
        (&args[1], &args[2])
    };
    let (min, max) = score_range(min_arg, max_arg)?;

    // [WITHSCORES] [LIMIT offset count], in that order, each at most once.
    let mut rest = &args[3..];
    let with_scores = match rest.split_first() {
        Some((opt, tail)) if lower(opt) == "withscores" => {
            rest = tail;
            true
        }
        _ => false,
    };
    let limit = match rest {
        [] => Limit::default(),
        [opt, offset, count] if lower(opt) == "limit" => parse_limit(offset, count)?,
        _ => return Err(XdisError::Syntax),
    };

    let pairs = s
        .db()
        .zsets()
        .zrange_by_score(&args[0], min, max, limit, reverse)?;
    Ok(pairs_reply(pairs, with_scores))
}

/// ZRANGEBYSCORE key min max [WITHSCORES] [LIMIT offset count]
fn zrangebyscore(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    range_by_score("zrangebyscore", false, s, args)
}

/// ZREVRANGEBYSCORE key max min [WITHSCORES] [LIMIT offset count]
fn zrevrangebyscore(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    range_by_score("zrevrangebyscore", true, s, args)
}

/// ZRANGEBYLEX key min max [LIMIT offset count]
fn zrangebylex(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    let limit = match args.len() {
        3 => Limit::default(),
        6 if lower(&args[3]) == "limit" => parse_limit(&args[4], &args[5])?,
        6 => return Err(XdisError::Syntax),
        _ => return Err(XdisError::WrongArgCount("zrangebylex".to_string())),
    };
    let min = parse_lex_bound(&args[1])?;
    let max = parse_lex_bound(&args[2])?;
    Ok(Reply::bulks(
        s.db().zsets().zrange_by_lex(&args[0], &min, &max, limit)?,
    ))
}

fn rank(cmd: &str, reverse: bool, s: &Session, args: &[Bytes]) -> Result<Reply> {
    check_exact(cmd, args, 2)?;
    Ok(match s.db().zsets().zrank(&args[0], &args[1], reverse)? {
        Some(r) => Reply::Int(r),
        None => Reply::Nil,
    })
}

/// ZRANK key member
fn zrank(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    rank("zrank", false, s, args)
}

/// ZREVRANK key member
fn zrevrank(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    rank("zrevrank", true, s, args)
}

/// ZREM key member [member ...]
fn zrem(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_arity("zrem", args, 2)?;
    Ok(Reply::Int(s.db().zsets().zrem(&args[0], &args[1..])?))
}

/// ZREMRANGEBYLEX key min max
fn zremrangebylex(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("zremrangebylex", args, 3)?;
    let min = parse_lex_bound(&args[1])?;
    let max = parse_lex_bound(&args[2])?;
    Ok(Reply::Int(
        s.db().zsets().zrem_range_by_lex(&args[0], &min, &max)?,
    ))
}

/// ZREMRANGEBYRANK key start stop
fn zremrangebyrank(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("zremrangebyrank", args, 3)?;
    let start = parse_i64(&args[1])?;
    let stop = parse_i64(&args[2])?;
    Ok(Reply::Int(
        s.db().zsets().zrem_range_by_rank(&args[0], start, stop)?,
    ))
}

/// ZREMRANGEBYSCORE key min max
fn zremrangebyscore(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("zremrangebyscore", args, 3)?;
    let (min, max) = score_range(&args[1], &args[2])?;
    Ok(Reply::Int(
        s.db().zsets().zrem_range_by_score(&args[0], min, max)?,
    ))
}

/// ZSCORE key member
fn zscore(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("zscore", args, 2)?;
    Ok(match s.db().zsets().zscore(&args[0], &args[1])? {
        Some(score) => int_bulk(score),
        None => Reply::Nil,
    })
}
