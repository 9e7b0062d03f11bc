use autoreply_core::{Config, init_logging};
use autoreply_core::gmail::{AuthorizedUser, ClientSecrets, GMAIL_MODIFY_SCOPE, OAuthApp};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use reqwest::{Client, Url};
use std::env;
use std::error::Error;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time;

type AnyError = Box<dyn Error + Send + Sync>;

const CALLBACK_PATH: &str = "/oauth2callback";
const SUCCESS_HTML: &str = r#"<!doctype html>
<html>
  <head><title>Gmail OAuth</title></head>
  <body style="font-family: sans-serif;">
    <h2>You can close this window</h2>
    <p>The auto-reply service is now authorized.</p>
  </body>
</html>
"#;

#[derive(Debug, Clone)]
struct Inputs {
    credentials: PathBuf,
    token: PathBuf,
    scopes: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    init_logging(&env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string()))?;
    let inputs = gather_inputs()?;
    let secrets = ClientSecrets::load(&inputs.credentials).await?;
    let app = secrets.oauth_app();
    let state = random_state();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let redirect_uri = format!("http://127.0.0.1:{}{}", port, CALLBACK_PATH);

    let auth_url = app.authorization_url(&redirect_uri, &inputs.scopes, &state)?;
    println!("Opening browser for Google consent...");
    if let Err(err) = maybe_open_browser(auth_url.as_str()) {
        eprintln!("Could not open browser automatically: {err}. Please open the URL manually.");
    }
    println!(
        "If the browser did not open, paste this into a new tab:\n{}\n",
        auth_url
    );
    println!("Listening on {} for the OAuth callback...\n", redirect_uri);

    let code = match time::timeout(Duration::from_secs(300), wait_for_code(listener, state)).await {
        Ok(result) => result?,
        Err(_) => return Err("Timed out waiting for OAuth callback (5 minutes)".into()),
    };

    println!("Received authorization code, exchanging for tokens...");
    let client = Client::new();
    write_token_file(&client, &app, &code, &redirect_uri, &inputs.token).await?;

    println!("\nSaved authorized user to {}", inputs.token.display());
    println!("Done. Keep this file private; it holds your refresh token.");
    Ok(())
}

/// Paths come from the service config when `CONFIG_PATH` (or `config.toml`) is
/// readable, with `GMAIL_CREDENTIALS` / `GMAIL_TOKEN` taking precedence.
fn gather_inputs() -> Result<Inputs, AnyError> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path).ok();

    let credentials = env_path("GMAIL_CREDENTIALS")
        .or_else(|| config.as_ref().map(|c| c.paths.credentials.clone()))
        .unwrap_or_else(|| PathBuf::from("credentials.json"));
    let token = env_path("GMAIL_TOKEN")
        .or_else(|| config.as_ref().map(|c| c.paths.token.clone()))
        .unwrap_or_else(|| PathBuf::from("token.json"));

    let scopes = match env::var("GMAIL_OAUTH_SCOPES") {
        Ok(value) if !value.trim().is_empty() => {
            value.split_whitespace().map(|s| s.to_string()).collect()
        }
        _ => vec![GMAIL_MODIFY_SCOPE.to_string()],
    };

    Ok(Inputs {
        credentials,
        token,
        scopes,
    })
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn random_state() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

async fn write_token_file(
    client: &Client,
    app: &OAuthApp,
    code: &str,
    redirect_uri: &str,
    token_path: &Path,
) -> Result<AuthorizedUser, AnyError> {
    let tokens = app.exchange_code(client, code, redirect_uri).await?;
    let user = AuthorizedUser::new(app, &tokens);
    user.save(token_path).await?;
    Ok(user)
}

async fn wait_for_code(listener: TcpListener, expected_state: String) -> Result<String, AnyError> {
    let (mut stream, _addr) = listener.accept().await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    // Read until the end of headers or a reasonable limit.
    for _ in 0..16 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            break;
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let request_line = request.lines().next().ok_or("Malformed HTTP request")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    if method != "GET" {
        send_response(&mut stream, 405, "Only GET is supported").await?;
        return Err("Unexpected HTTP method".into());
    }

    let url = match Url::parse(&format!("http://localhost{}", path)) {
        Ok(url) => url,
        Err(err) => {
            send_response(
                &mut stream,
                400,
                "Malformed OAuth callback URL. Please retry the OAuth flow.",
            )
            .await?;
            return Err(err.into());
        }
    };
    let mut code: Option<String> = None;
    let mut state: Option<String> = None;
    let mut denied: Option<String> = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.to_string()),
            "state" => state = Some(value.to_string()),
            "error" => denied = Some(value.to_string()),
            _ => {}
        }
    }

    if let Some(reason) = denied {
        send_response(&mut stream, 400, "Consent was not granted.").await?;
        return Err(format!("Authorization denied: {reason}").into());
    }

    let code = match code {
        Some(code) if !code.is_empty() => code,
        _ => {
            send_response(
                &mut stream,
                400,
                "Missing code in callback. Please retry the OAuth flow.",
            )
            .await?;
            return Err("Missing code in callback".into());
        }
    };

    if state.as_deref() != Some(expected_state.as_str()) {
        send_response(
            &mut stream,
            400,
            "State mismatch, please retry the OAuth flow.",
        )
        .await?;
        return Err("State mismatch".into());
    }

    send_response(&mut stream, 200, SUCCESS_HTML).await?;
    Ok(code)
}

async fn send_response(
    stream: &mut tokio::net::TcpStream,
    status: u16,
    body: &str,
) -> io::Result<()> {
    let status_line = match status {
        200 => "200 OK",
        400 => "400 Bad Request",
        405 => "405 Method Not Allowed",
        _ => "200 OK",
    };

    let response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await
}

fn maybe_open_browser(url: &str) -> Result<(), AnyError> {
    #[cfg(target_os = "macos")]
    let mut command = Command::new("open");
    #[cfg(target_os = "linux")]
    let mut command = Command::new("xdg-open");
    #[cfg(target_os = "windows")]
    let mut command = {
        let mut cmd = Command::new("cmd");
        let escaped_url = url.replace('"', "\"\"");
        cmd.arg("/C").arg(format!("start \"\" \"{}\"", escaped_url));
        cmd
    };

    #[cfg(not(target_os = "windows"))]
    command.arg(url);
    let status = command.status()?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("browser command exited with status {status}").into())
    }
}
