//! [`RemoteService`] over the lichess.org HTTP API.
//!
//! Every call is blocking. Streams are newline-delimited JSON read line by line from the
//! response body; keep-alive blank lines are skipped, malformed lines are logged and skipped.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Lines};
use std::marker::PhantomData;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::challenge::DeclineReason;
use crate::matchmaking::OnlineBot;
use crate::remote::{
    ratings, Account, ChallengeAnswer, ChallengeRequest, EventStream, GameStream, Perf,
    RemoteError, RemoteService, TournamentInfo,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const ATTEMPTS: u32 = 3;

/// Client of one bot account.
#[derive(Debug, Clone)]
pub struct LichessClient {
    client: Client,
    base: Url,
    token: String,
}

impl LichessClient {
    /// Client for `base` (e.g. `https://lichess.org`) authenticated with a bot `token`.
    pub fn new(base: &str, token: &str) -> anyhow::Result<Self> {
        let base = Url::parse(base)?;
        let client = Client::builder()
            .user_agent(concat!("lichess-orchestrator/", env!("CARGO_PKG_VERSION")))
            .timeout(None::<Duration>)
            .build()?;
        Ok(LichessClient {
            client,
            base,
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, RemoteError> {
        self.base
            .join(path)
            .map_err(|e| RemoteError::Rejected(format!("bad url {path}: {e}")))
    }

    fn get(&self, url: Url) -> RequestBuilder {
        self.client.get(url).bearer_auth(&self.token)
    }

    fn post(&self, url: Url, form: &[(&str, &str)]) -> RequestBuilder {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form)
            .finish();
        self.client
            .post(url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
    }

    /// Short request, retried on transient failures.
    fn call(&self, build: impl Fn() -> Result<RequestBuilder, RemoteError>) -> Result<Response, RemoteError> {
        let mut delay = Duration::from_secs(1);
        let mut attempt = 1;
        loop {
            match send(build()?.timeout(REQUEST_TIMEOUT)) {
                Err(RemoteError::Transient(e)) if attempt < ATTEMPTS => {
                    debug!("attempt {attempt} failed: {e}");
                    thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn post_ok(&self, path: &str, form: &[(&str, &str)]) -> Result<(), RemoteError> {
        let url = self.url(path)?;
        self.call(|| Ok(self.post(url.clone(), form))).map(|_| ())
    }

    fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, RemoteError> {
        self.call(|| Ok(self.get(url.clone())))?
            .json()
            .map_err(|e| RemoteError::Transient(format!("bad answer: {e}")))
    }
}

fn send(builder: RequestBuilder) -> Result<Response, RemoteError> {
    let response = builder
        .send()
        .map_err(|e| RemoteError::Transient(e.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(RemoteError::RateLimited);
    }
    let body = response.text().unwrap_or_default();
    if status.is_server_error() {
        Err(RemoteError::Transient(format!("{status}: {body}")))
    } else {
        Err(RemoteError::Rejected(format!("{status}: {body}")))
    }
}

/// Newline-delimited JSON body.
struct NdJson<T> {
    lines: Lines<BufReader<Response>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> NdJson<T> {
    fn new(response: Response) -> Self {
        NdJson {
            lines: BufReader::new(response).lines(),
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Iterator for NdJson<T> {
    type Item = Result<T, RemoteError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(RemoteError::Transient(e.to_string()))),
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(value) => return Some(Ok(value)),
                Err(e) => warn!("skipping malformed line ({e}): {line}"),
            }
        }
    }
}

#[derive(Deserialize)]
struct User {
    id: String,
    username: String,
    #[serde(default)]
    perfs: HashMap<String, Perf>,
}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    online: bool,
}

#[derive(Deserialize)]
struct ChallengeLine {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    challenge: Option<crate::remote::ChallengeRef>,
    #[serde(default)]
    done: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "declineReason")]
    decline_reason: Option<String>,
}

impl RemoteService for LichessClient {
    fn account(&self) -> Result<Account, RemoteError> {
        self.get_json(self.url("/api/account")?)
    }

    fn stream_events(&self) -> Result<EventStream, RemoteError> {
        let response = send(self.get(self.url("/api/stream/event")?))?;
        Ok(Box::new(NdJson::new(response)))
    }

    fn stream_game(&self, game_id: &str) -> Result<GameStream, RemoteError> {
        let url = self.url(&format!("/api/bot/game/stream/{game_id}"))?;
        let response = send(self.get(url))?;
        Ok(Box::new(NdJson::new(response)))
    }

    fn accept_challenge(&self, id: &str) -> Result<(), RemoteError> {
        self.post_ok(&format!("/api/challenge/{id}/accept"), &[])
    }

    fn decline_challenge(&self, id: &str, reason: DeclineReason) -> Result<(), RemoteError> {
        self.post_ok(
            &format!("/api/challenge/{id}/decline"),
            &[("reason", reason.api_key())],
        )
    }

    fn create_challenge(&self, request: &ChallengeRequest) -> Result<ChallengeAnswer, RemoteError> {
        let url = self.url(&format!("/api/challenge/{}", request.opponent))?;
        let (limit, increment) = (request.initial.to_string(), request.increment.to_string());
        let form = [
            ("rated", if request.rated { "true" } else { "false" }),
            ("clock.limit", limit.as_str()),
            ("clock.increment", increment.as_str()),
            ("color", request.color.as_str()),
            ("variant", request.variant.api_key()),
            ("keepAliveStream", "true"),
        ];
        let response = send(self.post(url, &form).timeout(request.timeout))?;

        let mut id = None;
        for line in NdJson::<ChallengeLine>::new(response) {
            let line = match line {
                Ok(line) => line,
                // the body read timed out: nobody answered
                Err(RemoteError::Transient(_)) => return Ok(ChallengeAnswer::NoAnswer { id }),
                Err(e) => return Err(e),
            };
            if let Some(error) = line.error {
                return Err(RemoteError::Rejected(error));
            }
            if let Some(new_id) = line.id.or(line.challenge.map(|c| c.id)) {
                id = Some(new_id);
            }
            match (line.done.as_deref(), &id) {
                (Some("accepted"), Some(id)) => return Ok(ChallengeAnswer::Accepted { id: id.clone() }),
                (Some("declined"), _) => {
                    return Ok(ChallengeAnswer::Declined {
                        id,
                        reason: line.decline_reason,
                    })
                }
                _ => {}
            }
        }
        Ok(ChallengeAnswer::NoAnswer { id })
    }

    fn cancel_challenge(&self, id: &str) -> Result<(), RemoteError> {
        self.post_ok(&format!("/api/challenge/{id}/cancel"), &[])
    }

    fn send_move(&self, game_id: &str, uci: &str) -> Result<(), RemoteError> {
        self.post_ok(&format!("/api/bot/game/{game_id}/move/{uci}"), &[])
    }

    fn resign_game(&self, game_id: &str) -> Result<(), RemoteError> {
        self.post_ok(&format!("/api/bot/game/{game_id}/resign"), &[])
    }

    fn abort_game(&self, game_id: &str) -> Result<(), RemoteError> {
        self.post_ok(&format!("/api/bot/game/{game_id}/abort"), &[])
    }

    fn join_tournament(
        &self,
        id: &str,
        team: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), RemoteError> {
        let team = team.map(str::to_ascii_lowercase);
        let mut form = vec![];
        if let Some(team) = &team {
            form.push(("team", team.as_str()));
        }
        if let Some(password) = password {
            form.push(("password", password));
        }
        self.post_ok(&format!("/api/tournament/{id}/join"), &form)
    }

    fn withdraw_tournament(&self, id: &str) -> Result<(), RemoteError> {
        self.post_ok(&format!("/api/tournament/{id}/withdraw"), &[])
    }

    fn tournament_info(&self, id: &str) -> Result<TournamentInfo, RemoteError> {
        self.get_json(self.url(&format!("/api/tournament/{id}"))?)
    }

    fn online_bots(&self) -> Result<Vec<OnlineBot>, RemoteError> {
        let url = self.url("/api/bot/online")?;
        let response = self.call(|| Ok(self.get(url.clone())))?;
        NdJson::<User>::new(response)
            .map(|user| {
                user.map(|u| OnlineBot {
                    ratings: ratings(&u.perfs),
                    id: u.id,
                    username: u.username,
                })
            })
            .collect()
    }

    fn user_online(&self, username: &str) -> Result<bool, RemoteError> {
        let mut url = self.url("/api/users/status")?;
        url.query_pairs_mut().append_pair("ids", username);
        let statuses: Vec<Status> = self.get_json(url)?;
        Ok(statuses.first().is_some_and(|s| s.online))
    }
}
