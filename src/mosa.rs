use std::{path::PathBuf, sync::Arc};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::network::{self, protocol::{Command, Message, Shape}, Session};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    NetworkError(#[from] network::Error),

    #[error("Could not send request")]
    RequestError,

    #[error("Did not receive response")]
    ResponseError,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Commands received from the ground station since they were last taken.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Commands {
    /// the last mission line received
    pub mission: Option<String>,
    pub behavior_changed: bool,
    pub circle: bool,
    pub triangle: bool,
    pub rectangle: bool,
}

impl Commands {
    fn apply(&mut self, command: Command) {
        match command {
            Command::Mission(line) => self.mission = Some(line),
            Command::ChangeBehavior(None) => self.behavior_changed = true,
            Command::ChangeBehavior(Some(Shape::Circle)) => self.circle = true,
            Command::ChangeBehavior(Some(Shape::Triangle)) => self.triangle = true,
            Command::ChangeBehavior(Some(Shape::Rectangle)) => self.rectangle = true,
            Command::GetPicture => {}
        }
    }
}

enum Request {
    TakeCommands {
        callback: oneshot::Sender<Commands>,
    },
}

/// Handle to the onboard side of the ground station session.
pub struct Mosa {
    request_tx: mpsc::UnboundedSender<Request>,
}

impl Mosa {
    /// Serves the commands arriving on `session`, which must be connected. Pictures are
    /// read from `camera_dir`.
    pub fn new(session: Arc<Session>, camera_dir: PathBuf) -> (Self, tokio::task::JoinHandle<Result<()>>) {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let (message_tx, mut message_rx) = mpsc::unbounded_channel();
            let receive = session.receive_loop(message_tx);
            tokio::pin!(receive);
            let mut commands = Commands::default();
            let mut receiving = true;
            loop {
                tokio::select! {
                    result = &mut receive, if receiving => {
                        result?;
                        receiving = false;
                    },
                    message = message_rx.recv() => match message {
                        Some(Message::Command(Command::GetPicture)) =>
                            send_picture(&session, &camera_dir).await,
                        Some(Message::Command(command)) => {
                            log::info!("Received {:?}", command);
                            commands.apply(command);
                        },
                        Some(message) => log::debug!("Ignoring {:?}", message),
                        None => break,
                    },
                    Some(request) = request_rx.recv() => match request {
                        Request::TakeCommands { callback } => {
                            let _ = callback.send(std::mem::take(&mut commands));
                        }
                    },
                }
            }
            Ok::<_, Error>(())
        });
        (Mosa { request_tx }, task)
    }

    /// Returns the commands received since the previous call and clears them.
    pub async fn take_commands(&self) -> Result<Commands> {
        let (callback, response) = oneshot::channel();
        self.request_tx.send(Request::TakeCommands { callback })
            .map_err(|_| Error::RequestError)?;
        response.await.map_err(|_| Error::ResponseError)
    }
}

async fn send_picture(session: &Session, camera_dir: &std::path::Path) {
    let path = camera_dir.join("picture").join("foto.jpg");
    match tokio::fs::read(&path).await {
        Ok(picture) => match session.send_raw(&picture).await {
            Ok(()) => log::info!("Sent picture {} ({} bytes)", path.display(), picture.len()),
            Err(error) => log::warn!("Could not send picture: {}", error),
        },
        Err(error) => log::warn!("Could not read picture {}: {}", path.display(), error),
    }
}

/// Waits for the ground station on the configured port and logs its commands until the
/// session ends.
pub async fn run(config: Arc<Config>, cancel: CancellationToken) -> Result<()> {
    let session = Arc::new(Session::new(&cancel));
    session.listen(config.network.mosa_port).await?;
    let (mosa, mut task) = Mosa::new(session, config.camera_dir.clone());
    let mut poll = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tokio::select! {
            result = &mut task => return result.map_err(|_| Error::ResponseError)?,
            _ = poll.tick() => if let Ok(commands) = mosa.take_commands().await {
                if commands != Commands::default() {
                    log::info!("Pending commands: {:?}", commands);
                }
            }
        }
    }
}
