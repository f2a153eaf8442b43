//! Transport lifecycle: region plus semaphore set
//!
//! The server owns every named object: it creates them at startup (removing
//! stale leftovers from a crashed predecessor first) and unlinks them on
//! drop, whether shutdown came from the protocol flag, a signal, or an error
//! path. The client only opens what already exists and never unlinks.

use tracing::warn;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::region::SharedRegion;
use crate::sem::Semaphore;
use crate::shm::{Creator, Opener, Shm};

/// Server side of the transport: creator of all named objects.
pub struct ServerTransport {
    region: Shm<SharedRegion, Creator>,
    ready: Semaphore<Creator>,
    prompt_written: Semaphore<Creator>,
    response_written: Semaphore<Creator>,
    chunk_ready: Semaphore<Creator>,
}

impl ServerTransport {
    /// Create the shared region and the four semaphores.
    ///
    /// A previous server that died without cleanup leaves the names bound;
    /// those are unlinked and recreated, with a warning naming each
    /// recovered object. Any other failure is fatal and names the resource.
    pub fn create(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let shm_name = config.shm_name();
        if Shm::<SharedRegion, Creator>::unlink(&shm_name)? {
            warn!("removed stale shared memory {shm_name} from a previous run");
        }
        let region = Shm::create(&shm_name)?;

        let create_sem = |name: String| -> Result<Semaphore<Creator>, BridgeError> {
            if Semaphore::unlink(&name)? {
                warn!("removed stale semaphore {name} from a previous run");
            }
            Semaphore::create(&name)
        };

        let ready = create_sem(config.sem_ready_name())?;
        let prompt_written = create_sem(config.sem_prompt_written_name())?;
        let response_written = create_sem(config.sem_response_written_name())?;
        let chunk_ready = create_sem(config.sem_chunk_ready_name())?;

        Ok(Self {
            region,
            ready,
            prompt_written,
            response_written,
            chunk_ready,
        })
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut SharedRegion {
        &mut self.region
    }

    pub fn ready(&self) -> &Semaphore<Creator> {
        &self.ready
    }

    pub fn prompt_written(&self) -> &Semaphore<Creator> {
        &self.prompt_written
    }

    pub fn response_written(&self) -> &Semaphore<Creator> {
        &self.response_written
    }

    pub fn chunk_ready(&self) -> &Semaphore<Creator> {
        &self.chunk_ready
    }

    /// Mutable region plus the chunk semaphore, borrowed together for the
    /// streaming publisher.
    pub fn split_for_streaming(&mut self) -> (&mut SharedRegion, &Semaphore<Creator>) {
        (&mut self.region, &self.chunk_ready)
    }
}

/// Client side of the transport: opens existing objects only.
pub struct ClientTransport {
    region: Shm<SharedRegion, Opener>,
    ready: Semaphore<Opener>,
    prompt_written: Semaphore<Opener>,
    response_written: Semaphore<Opener>,
    chunk_ready: Semaphore<Opener>,
}

impl std::fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransport").finish_non_exhaustive()
    }
}

impl ClientTransport {
    /// Open the objects a running server created. Fails if the server is
    /// not up (or crashed and cleaned up), naming the missing resource.
    pub fn open(config: &BridgeConfig) -> Result<Self, BridgeError> {
        Ok(Self {
            region: Shm::open(&config.shm_name())?,
            ready: Semaphore::open(&config.sem_ready_name())?,
            prompt_written: Semaphore::open(&config.sem_prompt_written_name())?,
            response_written: Semaphore::open(&config.sem_response_written_name())?,
            chunk_ready: Semaphore::open(&config.sem_chunk_ready_name())?,
        })
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut SharedRegion {
        &mut self.region
    }

    pub fn ready(&self) -> &Semaphore<Opener> {
        &self.ready
    }

    pub fn prompt_written(&self) -> &Semaphore<Opener> {
        &self.prompt_written
    }

    pub fn response_written(&self) -> &Semaphore<Opener> {
        &self.response_written
    }

    pub fn chunk_ready(&self) -> &Semaphore<Opener> {
        &self.chunk_ready
    }
}
