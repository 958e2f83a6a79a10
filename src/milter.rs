use crate::config::{Config, UnavailablePolicy};
use crate::scanner::{MessageReport, ScanRequest, Scanner};
use crate::spamd::MetricAction;
use indymilter::{
    run, Actions, Callbacks, Config as IndyConfig, Context, ContextActions, EomContext,
    SetErrorReply, SocketInfo, Status,
};
use std::ffi::{CStr, CString};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::net::UnixListener;

/// Settings the callbacks need besides the scanner itself.
#[derive(Debug, Clone)]
struct MilterSettings {
    spool_dir: PathBuf,
    policy: UnavailablePolicy,
    reject_message: String,
}

pub struct Milter {
    scanner: Arc<Scanner>,
    settings: Arc<MilterSettings>,
}

/// Per-connection state, kept in the milter context.
#[derive(Debug, Default)]
pub struct Session {
    client_ip: Option<String>,
    helo: Option<String>,
    message: Option<Message>,
}

/// The message being received, spooled to disk as it arrives.
#[derive(Debug)]
pub struct Message {
    from: Option<String>,
    rcpts: Vec<String>,
    user: Option<String>,
    spool: NamedTempFile,
}

impl Message {
    fn new(spool_dir: &std::path::Path, from: Option<String>) -> io::Result<Self> {
        let spool = tempfile::Builder::new()
            .prefix("scan-milter.")
            .tempfile_in(spool_dir)?;
        Ok(Message {
            from,
            rcpts: Vec::new(),
            user: None,
            spool,
        })
    }

    fn write_header(&mut self, name: &CStr, value: &CStr) -> io::Result<()> {
        let file = self.spool.as_file_mut();
        file.write_all(name.to_bytes())?;
        file.write_all(b": ")?;
        file.write_all(value.to_bytes())?;
        file.write_all(b"\r\n")
    }

    fn end_of_headers(&mut self) -> io::Result<()> {
        self.spool.as_file_mut().write_all(b"\r\n")
    }

    fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.spool.as_file_mut().write_all(chunk)
    }
}

/// What to tell the MTA about a scanned message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Accept,
    Reject(String),
    Tempfail,
}

/// Modifications and final status derived from a [`MessageReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub disposition: Disposition,
    pub headers: Vec<(String, String)>,
    pub subject: Option<String>,
    pub add_recipients: Vec<String>,
}

pub fn plan(report: &MessageReport, policy: UnavailablePolicy, reject_message: &str) -> Plan {
    let mut plan = Plan {
        disposition: Disposition::Accept,
        headers: Vec::new(),
        subject: None,
        add_recipients: Vec::new(),
    };

    if let Some(signature) = report.infected() {
        plan.disposition = Disposition::Reject(format!("Infected: {signature}"));
        return plan;
    }
    if report.has_failures() {
        match policy {
            UnavailablePolicy::Accept => {}
            UnavailablePolicy::Tempfail => {
                plan.disposition = Disposition::Tempfail;
                return plan;
            }
            UnavailablePolicy::Reject => {
                plan.disposition =
                    Disposition::Reject("Message could not be scanned".to_string());
                return plan;
            }
        }
    }

    let mut action = MetricAction::NoAction;
    for verdict in report.spam_verdicts() {
        plan.headers.extend(verdict.headers.iter().cloned());
        plan.add_recipients.extend(verdict.add_recipients.iter().cloned());
        if verdict.action > action {
            action = verdict.action;
            if action == MetricAction::RewriteSubject {
                plan.subject = verdict.subject.clone();
            }
        }
    }

    match action {
        MetricAction::Reject => plan.disposition = Disposition::Reject(reject_message.to_string()),
        MetricAction::Greylist => plan.disposition = Disposition::Tempfail,
        MetricAction::AddHeader => plan.headers.push(("X-Spam".to_string(), "Yes".to_string())),
        MetricAction::RewriteSubject | MetricAction::NoAction => {}
    }
    if action != MetricAction::RewriteSubject {
        plan.subject = None;
    }
    plan
}

/// Runs the blocking scanner off the async executor. The spool file is
/// kept alive until the daemons are done with it.
pub async fn scan_spooled(
    scanner: Arc<Scanner>,
    request: ScanRequest,
    spool: NamedTempFile,
) -> anyhow::Result<MessageReport> {
    let report = tokio::task::spawn_blocking(move || {
        let report = scanner.scan_message(&request);
        drop(spool);
        report
    })
    .await?;
    Ok(report)
}

fn envelope_address(args: &[CString]) -> Option<String> {
    let first = args.first()?.to_string_lossy();
    let addr = first.trim().trim_start_matches('<').trim_end_matches('>');
    Some(addr.to_string())
}

/// Peer address for TCP connections; local sockets have none.
fn client_ip(socket_info: &SocketInfo) -> Option<String> {
    match socket_info {
        SocketInfo::Inet(addr) => Some(addr.ip().to_string()),
        _ => None,
    }
}

fn macro_value(value: Option<&CStr>) -> Option<String> {
    value
        .map(|v| v.to_string_lossy().into_owned())
        .filter(|v| !v.is_empty())
}

/// Applies `f` to the message in progress; I/O failures tempfail it.
fn with_message<F>(ctx: &mut Context<Session>, f: F) -> Status
where
    F: FnOnce(&mut Message) -> io::Result<()>,
{
    let Some(message) = ctx.data.as_mut().and_then(|s| s.message.as_mut()) else {
        return Status::Continue;
    };
    match f(message) {
        Ok(()) => Status::Continue,
        Err(e) => {
            log::error!("cannot write spool file {}: {e}", message.spool.path().display());
            Status::Tempfail
        }
    }
}

impl Milter {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let scanner = Arc::new(Scanner::new(config)?);
        let settings = Arc::new(MilterSettings {
            spool_dir: PathBuf::from(&config.spool_dir),
            policy: config.policy.on_unavailable,
            reject_message: config.spamd.reject_message.clone(),
        });
        Ok(Milter { scanner, settings })
    }

    pub async fn run(&self, socket_path: &str) -> anyhow::Result<()> {
        log::info!("Starting milter on: {}", socket_path);
        if std::path::Path::new(socket_path).exists() {
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        let scanner = self.scanner.clone();
        let settings = self.settings.clone();

        let callbacks: Callbacks<Session> = Callbacks {
            connect: Some(Box::new(
                move |ctx: &mut Context<Session>, hostname, socket_info| {
                    Box::pin(async move {
                        let client_ip = client_ip(&socket_info);
                        log::debug!(
                            "Connection from: {} [{}]",
                            hostname.to_string_lossy(),
                            client_ip.as_deref().unwrap_or("local")
                        );
                        ctx.data = Some(Session {
                            client_ip,
                            ..Default::default()
                        });
                        Status::Continue
                    })
                },
            )),

            helo: Some(Box::new(move |ctx: &mut Context<Session>, helo| {
                Box::pin(async move {
                    if let Some(session) = ctx.data.as_mut() {
                        session.helo = Some(helo.to_string_lossy().into_owned());
                    }
                    Status::Continue
                })
            })),

            mail: Some(Box::new({
                let settings = settings.clone();
                move |ctx: &mut Context<Session>, args| {
                    let settings = settings.clone();
                    Box::pin(async move {
                        let from = envelope_address(&args);
                        log::debug!("Mail from: {}", from.as_deref().unwrap_or(""));
                        let user = macro_value(ctx.macros.get(c"{auth_authen}"));
                        let mut message = match Message::new(&settings.spool_dir, from) {
                            Ok(message) => message,
                            Err(e) => {
                                log::error!(
                                    "cannot create spool file in {}: {e}",
                                    settings.spool_dir.display()
                                );
                                return Status::Tempfail;
                            }
                        };
                        message.user = user;
                        ctx.data.get_or_insert_with(Session::default).message = Some(message);
                        Status::Continue
                    })
                }
            })),

            rcpt: Some(Box::new(move |ctx: &mut Context<Session>, args| {
                Box::pin(async move {
                    if let Some(rcpt) = envelope_address(&args) {
                        log::debug!("Rcpt to: {}", rcpt);
                        with_message(ctx, |m| {
                            m.rcpts.push(rcpt);
                            Ok(())
                        })
                    } else {
                        Status::Continue
                    }
                })
            })),

            header: Some(Box::new(
                move |ctx: &mut Context<Session>, name, value| {
                    Box::pin(async move { with_message(ctx, |m| m.write_header(&name, &value)) })
                },
            )),

            eoh: Some(Box::new(move |ctx: &mut Context<Session>| {
                Box::pin(async move { with_message(ctx, Message::end_of_headers) })
            })),

            body: Some(Box::new(move |ctx: &mut Context<Session>, chunk| {
                Box::pin(async move { with_message(ctx, |m| m.write_body(&chunk)) })
            })),

            eom: Some(Box::new({
                let scanner = scanner.clone();
                let settings = settings.clone();
                move |ctx: &mut EomContext<Session>| {
                    let scanner = scanner.clone();
                    let settings = settings.clone();
                    Box::pin(async move {
                        let queue_id = macro_value(ctx.macros.get(c"i"))
                            .unwrap_or_else(|| "unknown".to_string());
                        let Some(session) = ctx.data.as_mut() else {
                            return Status::Accept;
                        };
                        let Some(mut message) = session.message.take() else {
                            return Status::Accept;
                        };
                        if let Err(e) = message.spool.as_file_mut().flush() {
                            log::error!("cannot flush spool file: {e}");
                            return Status::Tempfail;
                        }

                        let request = ScanRequest {
                            path: message.spool.path().to_path_buf(),
                            from: message.from,
                            rcpts: message.rcpts,
                            helo: session.helo.clone(),
                            ip: session.client_ip.clone(),
                            user: message.user,
                            queue_id: queue_id.clone(),
                            extra: false,
                        };
                        log::info!("End of message {queue_id} - scanning");

                        let report = match scan_spooled(scanner, request, message.spool).await {
                            Ok(report) => report,
                            Err(e) => {
                                log::error!("scan of {queue_id} did not complete: {e}");
                                return Status::Tempfail;
                            }
                        };

                        let plan = plan(&report, settings.policy, &settings.reject_message);
                        match plan.disposition {
                            Disposition::Reject(reason) => {
                                log::info!("Rejecting message {queue_id}: {reason}");
                                if let Err(e) =
                                    ctx.reply.set_error_reply("550", Some("5.7.1"), vec![reason])
                                {
                                    log::warn!("Failed to set reply: {e}");
                                }
                                return Status::Reject;
                            }
                            Disposition::Tempfail => {
                                log::info!("Temporarily failing message {queue_id}");
                                return Status::Tempfail;
                            }
                            Disposition::Accept => {}
                        }

                        for (name, value) in plan.headers {
                            if let Err(e) = ctx.actions.add_header(name, value).await {
                                log::error!("Failed to add header: {}", e);
                            }
                        }
                        if let Some(subject) = plan.subject {
                            if let Err(e) =
                                ctx.actions.change_header("Subject", 1, Some(subject)).await
                            {
                                log::error!("Failed to rewrite subject: {}", e);
                            }
                        }
                        for rcpt in plan.add_recipients {
                            if let Err(e) = ctx.actions.add_recipient(rcpt).await {
                                log::error!("Failed to add recipient: {}", e);
                            }
                        }
                        log::info!("Accepting message {queue_id}");
                        Status::Accept
                    })
                }
            })),

            abort: Some(Box::new(move |ctx: &mut Context<Session>| {
                Box::pin(async move {
                    if let Some(session) = ctx.data.as_mut() {
                        session.message = None;
                    }
                    Status::Continue
                })
            })),

            close: Some(Box::new(move |ctx: &mut Context<Session>| {
                Box::pin(async move {
                    ctx.data = None;
                    Status::Continue
                })
            })),

            ..Default::default()
        };

        let config = IndyConfig {
            actions: Actions::ADD_HEADER | Actions::CHANGE_HEADER | Actions::ADD_RCPT,
            ..Default::default()
        };

        run(listener, callbacks, config, tokio::signal::ctrl_c()).await?;
        Ok(())
    }
}
