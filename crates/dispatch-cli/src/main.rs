//! CLI de operación del núcleo de despacho.
//!
//! ```text
//! dispatch-cli submit   --params '<JSON>' [--claims '<JSON>'] [--session <ID>] [--job <ID>]
//! dispatch-cli status   --session <ID> --job <ID> [--claims '<JSON>']
//! dispatch-cli callback --job <ID> --status <ST> --attempt <N> [--session <ID>] [--details '<JSON>']
//! dispatch-cli inspect  --session <ID> --job <ID>
//! dispatch-cli gc-report [--expired]
//! ```
//!
//! Códigos de salida: 0 ok, 2 uso, 3 JSON inválido, 4 rechazado
//! (validación/autorización/inexistente), 5 error interno.

use std::collections::HashMap;

use chrono::Utc;
use dispatch_adapters::route_callback;
use dispatch_core::{classify_error, inspect_record, list_records, BackendCallback, ClaimsResolver, CredentialResolver,
                    DispatchError, DispatchRequest, ErrorClass, JobId, JobStatus, RecordKey, RequestParameters,
                    SessionId};
use dispatchflow::{build_services, AppConfig, Services};
use serde::Serialize;
use serde_json::Value;

const USAGE: &str = "Uso: dispatch-cli <submit|status|callback|inspect|gc-report> [opciones]";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Submit {
        params: Value,
        claims: Option<String>,
        session: Option<String>,
        job: Option<String>,
    },
    Status {
        session: String,
        job: String,
        claims: Option<String>,
    },
    Callback {
        job: String,
        status: String,
        session: Option<String>,
        attempt: u32,
        details: Value,
    },
    Inspect {
        session: String,
        job: String,
    },
    GcReport {
        expired_only: bool,
    },
}

#[derive(Debug, PartialEq)]
enum CliError {
    Usage(String),
    Json(String),
}

/// Opciones `--clave valor` (y flags sin valor) tras el subcomando.
fn options(args: &[String]) -> Result<HashMap<String, Option<String>>, CliError> {
    let mut out = HashMap::new();
    let mut i = 0;
    while i < args.len() {
        let Some(name) = args[i].strip_prefix("--") else {
            return Err(CliError::Usage(format!("argumento inesperado '{}'", args[i])));
        };
        let value = args.get(i + 1).filter(|v| !v.starts_with("--")).cloned();
        if value.is_some() {
            i += 1;
        }
        out.insert(name.to_string(), value);
        i += 1;
    }
    Ok(out)
}

fn required(opts: &HashMap<String, Option<String>>, name: &str) -> Result<String, CliError> {
    opts.get(name)
        .cloned()
        .flatten()
        .ok_or_else(|| CliError::Usage(format!("falta --{name}")))
}

fn optional(opts: &HashMap<String, Option<String>>, name: &str) -> Option<String> {
    opts.get(name).cloned().flatten()
}

fn json_arg(raw: &str, name: &str) -> Result<Value, CliError> {
    serde_json::from_str(raw).map_err(|e| CliError::Json(format!("--{name}: {e}")))
}

fn parse_args(args: &[String]) -> Result<Command, CliError> {
    let Some((cmd, rest)) = args.split_first() else {
        return Err(CliError::Usage(USAGE.into()));
    };
    let opts = options(rest)?;
    match cmd.as_str() {
        "submit" => Ok(Command::Submit { params: json_arg(&required(&opts, "params")?, "params")?,
                                         claims: optional(&opts, "claims"),
                                         session: optional(&opts, "session"),
                                         job: optional(&opts, "job") }),
        "status" => Ok(Command::Status { session: required(&opts, "session")?,
                                         job: required(&opts, "job")?,
                                         claims: optional(&opts, "claims") }),
        "callback" => {
            let raw = required(&opts, "attempt")?;
            let attempt = raw.parse::<u32>()
                             .map_err(|_| CliError::Usage(format!("--attempt inválido '{raw}'")))?;
            let details = match optional(&opts, "details") {
                Some(d) => json_arg(&d, "details")?,
                None => Value::Null,
            };
            Ok(Command::Callback { job: required(&opts, "job")?,
                                   status: required(&opts, "status")?,
                                   session: optional(&opts, "session"),
                                   attempt,
                                   details })
        }
        "inspect" => Ok(Command::Inspect { session: required(&opts, "session")?,
                                           job: required(&opts, "job")? }),
        "gc-report" => Ok(Command::GcReport { expired_only: opts.contains_key("expired") }),
        other => Err(CliError::Usage(format!("subcomando desconocido '{other}'\n{USAGE}"))),
    }
}

fn key_of(session: &str, job: &str) -> Result<RecordKey, DispatchError> {
    Ok(RecordKey::new(SessionId::parse(session)?, JobId::parse(job)?))
}

fn execute(services: &Services, cmd: Command) -> Result<Value, DispatchError> {
    let now = Utc::now();
    match cmd {
        Command::Submit { params, claims, session, job } => {
            let identity = ClaimsResolver.resolve(claims.as_deref(), now)?;
            let mut req = DispatchRequest::new(RequestParameters::from_value(params)?, identity);
            if let Some(s) = session {
                req = req.with_session(SessionId::parse(&s)?);
            }
            if let Some(j) = job {
                req = req.with_job_id(JobId::parse(&j)?);
            }
            to_json(&services.machine.handle_request(req)?)
        }
        Command::Status { session, job, claims } => {
            let identity = ClaimsResolver.resolve(claims.as_deref(), now)?;
            let key = key_of(&session, &job)?;
            to_json(&services.machine.handle_request(DispatchRequest::poll(&key, identity))?)
        }
        Command::Callback { job, status, session, attempt, details } => {
            let status: JobStatus = status.parse()?;
            let callback = match session {
                Some(s) => BackendCallback::new(&key_of(&s, &job)?, attempt, status, details),
                None => route_callback(services.store.as_ref(), &JobId::parse(&job)?, attempt, status, details)?,
            };
            to_json(&services.machine.on_backend_status(callback)?)
        }
        Command::Inspect { session, job } => to_json(&inspect_record(services.store.as_ref(), &key_of(&session, &job)?)?),
        Command::GcReport { expired_only } => {
            let records: Vec<_> = list_records(services.store.as_ref())?.into_iter()
                                                                        .filter(|r| !expired_only || r.credential_expired(now))
                                                                        .collect();
            to_json(&records)
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, DispatchError> {
    serde_json::to_value(value).map_err(|e| DispatchError::Storage(format!("encode output: {e}")))
}

fn exit_code(err: &DispatchError) -> i32 {
    match classify_error(err) {
        ErrorClass::Validation | ErrorClass::Authorization => 4,
        ErrorClass::Transient | ErrorClass::Permanent => 5,
    }
}

fn main() {
    // Cargar .env si existe (DATABASE_URL, DISPATCH_*)
    let _ = dotenvy::dotenv();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cmd = match parse_args(&args) {
        Ok(c) => c,
        Err(CliError::Usage(msg)) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
        Err(CliError::Json(msg)) => {
            eprintln!("JSON inválido en {msg}");
            std::process::exit(3);
        }
    };
    let services = match build_services(&AppConfig::from_env()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[dispatch-cli] wiring error: {e}");
            std::process::exit(5);
        }
    };
    match execute(&services, cmd) {
        Ok(out) => match serde_json::to_string_pretty(&out) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("[dispatch-cli] {e}");
                std::process::exit(5);
            }
        },
        Err(e) => {
            eprintln!("[dispatch-cli] {}", e.public_message());
            std::process::exit(exit_code(&e));
        }
    }
}
