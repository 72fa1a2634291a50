//! Connection and server control commands.
//!
//! SUBSCRIBE and PSUBSCRIBE are not here: they switch the connection into
//! message-delivery mode, which only the connection loop can do.

use super::{check_exact, lower, parse_i64, CmdCategory, CmdContext, CommandRegistry};
use crate::error::{Result, XdisError};
use crate::reply::{Reply, Status};
use crate::session::Session;
use bytes::Bytes;

const SERVER_NAME: &str = "xdis";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
const SERVER_MODE: &str = "standalone";

pub fn register(registry: &mut CommandRegistry) {
    let cat = CmdCategory::Server;
    registry.register_sync("auth", cat, auth);
    registry.register_sync("client", cat, client);
    registry.register_sync("echo", cat, echo);
    registry.register_sync("flushall", cat, flushall);
    registry.register_sync("flushdb", cat, flushdb);
    registry.register_sync("hello", cat, hello);
    registry.register_sync("info", cat, info);
    registry.register_sync("ping", cat, ping);
    registry.register_sync("publish", cat, publish);
    registry.register_sync("quit", cat, quit);
    registry.register_sync("select", cat, select);
}

/// AUTH [default] password
fn auth(ctx: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    let password = match args {
        [password] => password,
        [user, password] => {
            if lower(user) != "default" {
                return Err(XdisError::InvalidPassword);
            }
            password
        }
        _ => return Err(XdisError::WrongArgCount("auth".to_string())),
    };
    ctx.server.check_password(password)?;
    s.set_authenticated(true);
    Ok(Reply::ok())
}

/// CLIENT GETNAME | SETNAME name | ID
fn client(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    let Some((sub, rest)) = args.split_first() else {
        return Err(XdisError::WrongArgCount("client".to_string()));
    };
    match (lower(sub).as_str(), rest) {
        ("getname", []) => Ok(if s.name().is_empty() {
            Reply::Nil
        } else {
            Reply::bulk(s.name().to_string())
        }),
        ("setname", [name]) => {
            if name.iter().any(|b| *b <= b' ' || *b > b'~') {
                return Err(XdisError::InvalidArgument(
                    "Client names cannot contain spaces, newlines or special characters."
                        .to_string(),
                ));
            }
            s.set_name(String::from_utf8_lossy(name));
            Ok(Reply::ok())
        }
        ("id", []) => Ok(Reply::Int(s.id() as i64)),
        ("getname", _) | ("setname", _) | ("id", _) => {
            Err(XdisError::WrongArgCount("client".to_string()))
        }
        _ => Err(XdisError::Syntax),
    }
}

/// ECHO message
fn echo(_: CmdContext<'_>, _: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("echo", args, 1)?;
    Ok(Reply::Bulk(args[0].clone()))
}

/// FLUSHALL
fn flushall(ctx: CmdContext<'_>, _: &mut Session, _: &[Bytes]) -> Result<Reply> {
    ctx.server.flush_all()?;
    Ok(Reply::ok())
}

/// FLUSHDB
fn flushdb(_: CmdContext<'_>, s: &mut Session, _: &[Bytes]) -> Result<Reply> {
    s.db().flush()?;
    Ok(Reply::ok())
}

/// HELLO [protover [AUTH default password] [SETNAME name]]
///
/// The connection keeps speaking RESP2 whatever version is asked for; the
/// reply always reports `proto 2`. Every option is validated before any of
/// them is applied.
fn hello(ctx: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    if args.len() > 6 {
        let last = String::from_utf8_lossy(&args[args.len() - 1]).into_owned();
        return Err(XdisError::SyntaxOption("HELLO".to_string(), last));
    }

    if let Some(version) = args.first() {
        let version = parse_i64(version).map_err(|_| XdisError::ProtocolVersion)?;
        if !(2..=3).contains(&version) {
            return Err(XdisError::UnsupportedProtocol);
        }
    }

    let mut password = None;
    let mut name = None;
    let mut i = 1;
    while i < args.len() {
        let more = args.len() - i - 1;
        let op = lower(&args[i]);
        match op.as_str() {
            "auth" if more >= 2 => {
                if lower(&args[i + 1]) != "default" {
                    return Err(XdisError::InvalidPassword);
                }
                password = Some(&args[i + 2]);
                i += 3;
            }
            "setname" if more >= 1 => {
                name = Some(&args[i + 1]);
                i += 2;
            }
            _ => return Err(XdisError::SyntaxOption("HELLO".to_string(), op)),
        }
    }

    if let Some(password) = password {
        ctx.server.check_password(password)?;
        s.set_authenticated(true);
    }
    if let Some(name) = name {
        s.set_name(String::from_utf8_lossy(name));
    }

    Ok(Reply::Array(vec![
        Reply::bulk("server"),
        Reply::bulk(SERVER_NAME),
        Reply::bulk("version"),
        Reply::bulk(SERVER_VERSION),
        Reply::bulk("proto"),
        Reply::Int(2),
        Reply::bulk("mode"),
        Reply::bulk(SERVER_MODE),
    ]))
}

/// INFO [section]
fn info(ctx: CmdContext<'_>, _: &mut Session, args: &[Bytes]) -> Result<Reply> {
    let section = match args {
        [] => String::new(),
        [section] => lower(section),
        _ => return Err(XdisError::WrongArgCount("info".to_string())),
    };
    Ok(Reply::Bulk(ctx.server.info(&section)))
}

/// PING [message]
fn ping(_: CmdContext<'_>, _: &mut Session, args: &[Bytes]) -> Result<Reply> {
    match args {
        [] => Ok(Reply::Status(Status::Pong)),
        [message] => Ok(Reply::Bulk(message.clone())),
        _ => Err(XdisError::WrongArgCount("ping".to_string())),
    }
}

/// PUBLISH channel message
fn publish(ctx: CmdContext<'_>, _: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("publish", args, 2)?;
    Ok(Reply::Int(ctx.server.publish(&args[0], args[1].clone())))
}

/// QUIT
/// Replies OK; the connection closes once the reply is written.
fn quit(_: CmdContext<'_>, s: &mut Session, _: &[Bytes]) -> Result<Reply> {
    s.close()?;
    Ok(Reply::ok())
}

/// SELECT index
fn select(ctx: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
    check_exact("select", args, 1)?;
    let index = parse_i64(&args[0])?;
    let index = usize::try_from(index).map_err(|_| XdisError::DbIndex)?;
    let db = ctx.server.select_db(index)?;
    s.set_db(db);
    Ok(Reply::ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::test_support::{args, TestServer};

    #[test]
    fn test_ping_echo() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(
            ping(server.ctx(), &mut s, &[]).unwrap(),
            Reply::Status(Status::Pong)
        );
        assert_eq!(
            ping(server.ctx(), &mut s, &args(&["hi"])).unwrap(),
            Reply::bulk("hi")
        );
        assert!(ping(server.ctx(), &mut s, &args(&["a", "b"])).is_err());
        assert_eq!(
            echo(server.ctx(), &mut s, &args(&["x"])).unwrap(),
            Reply::bulk("x")
        );
    }

    #[test]
    fn test_client_name() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(
            client(server.ctx(), &mut s, &args(&["GETNAME"])).unwrap(),
            Reply::Nil
        );
        assert_eq!(
            client(server.ctx(), &mut s, &args(&["setname", "worker-1"])).unwrap(),
            Reply::ok()
        );
        assert_eq!(
            client(server.ctx(), &mut s, &args(&["getname"])).unwrap(),
            Reply::bulk("worker-1")
        );
        assert!(client(server.ctx(), &mut s, &args(&["setname", "a b"])).is_err());
        assert_eq!(
            client(server.ctx(), &mut s, &args(&["id"])).unwrap(),
            Reply::Int(s.id() as i64)
        );
        assert!(matches!(
            client(server.ctx(), &mut s, &args(&["kill"])),
            Err(XdisError::Syntax)
        ));
    }

    #[test]
    fn test_select_and_flush() {
        let server = TestServer::new();
        let mut s = server.session();
        s.db().strings().set(b"k", Bytes::from("v"), Default::default()).unwrap();
        assert_eq!(
            select(server.ctx(), &mut s, &args(&["3"])).unwrap(),
            Reply::ok()
        );
        assert_eq!(s.db_index(), 3);
        assert_eq!(s.db().strings().get(b"k").unwrap(), None);
        assert!(matches!(
            select(server.ctx(), &mut s, &args(&["16"])),
            Err(XdisError::DbIndex)
        ));
        assert!(matches!(
            select(server.ctx(), &mut s, &args(&["-1"])),
            Err(XdisError::DbIndex)
        ));

        select(server.ctx(), &mut s, &args(&["0"])).unwrap();
        flushdb(server.ctx(), &mut s, &[]).unwrap();
        assert_eq!(s.db().strings().get(b"k").unwrap(), None);
    }

    #[test]
    fn test_hello_versions() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(
            hello(server.ctx(), &mut s, &args(&["4"])).unwrap_err().to_string(),
            "NOPROTO unsupported protocol version"
        );
        assert!(matches!(
            hello(server.ctx(), &mut s, &args(&["x"])),
            Err(XdisError::ProtocolVersion)
        ));
        match hello(server.ctx(), &mut s, &args(&["3"])).unwrap() {
            Reply::Array(items) => {
                assert_eq!(items[0], Reply::bulk("server"));
                assert_eq!(items[5], Reply::Int(2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(hello(server.ctx(), &mut s, &[]).is_ok());
    }

    #[test]
    fn test_hello_options() {
        let mut server = TestServer::new();
        server.password = Some("secret".to_string());
        let mut s = server.session();

        assert_eq!(
            hello(server.ctx(), &mut s, &args(&["2", "SETNAME", "n", "bogus"]))
                .unwrap_err()
                .to_string(),
            "ERR syntax error in HELLO option 'bogus'"
        );
        assert_eq!(s.name(), "");

        assert!(matches!(
            hello(server.ctx(), &mut s, &args(&["2", "AUTH", "root", "secret"])),
            Err(XdisError::InvalidPassword)
        ));
        assert!(matches!(
            hello(server.ctx(), &mut s, &args(&["2", "AUTH", "default", "nope", "SETNAME", "n"])),
            Err(XdisError::InvalidPassword)
        ));
        assert_eq!(s.name(), "");
        assert!(!s.is_authenticated());

        hello(
            server.ctx(),
            &mut s,
            &args(&["3", "AUTH", "default", "secret", "SETNAME", "n"]),
        )
        .unwrap();
        assert!(s.is_authenticated());
        assert_eq!(s.name(), "n");

        assert!(matches!(
            hello(server.ctx(), &mut s, &args(&["2", "a", "b", "c", "d", "e", "f"])),
            Err(XdisError::SyntaxOption(_, _))
        ));
    }

    #[test]
    fn test_auth() {
        let server = TestServer::new();
        let mut s = server.session();
        assert!(matches!(
            auth(server.ctx(), &mut s, &args(&["pw"])),
            Err(XdisError::NoPassword)
        ));

        let mut server = TestServer::new();
        server.password = Some("pw".to_string());
        let mut s = server.session();
        assert!(matches!(
            auth(server.ctx(), &mut s, &args(&["bad"])),
            Err(XdisError::InvalidPassword)
        ));
        assert_eq!(auth(server.ctx(), &mut s, &args(&["default", "pw"])).unwrap(), Reply::ok());
        assert!(s.is_authenticated());
    }

    #[test]
    fn test_quit_closes_session() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(quit(server.ctx(), &mut s, &[]).unwrap(), Reply::ok());
        assert!(s.is_closed());
    }

    #[test]
    fn test_info_arity() {
        let server = TestServer::new();
        let mut s = server.session();
        assert_eq!(
            info(server.ctx(), &mut s, &args(&["Server"])).unwrap(),
            Reply::bulk("# server\r\n")
        );
        assert!(info(server.ctx(), &mut s, &args(&["a", "b"])).is_err());
    }
}
