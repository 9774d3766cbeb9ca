//! Timer portal - request dispatch of the timer service

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use vrt_base::{clock, cpu, CpuSet, Notification, TimeValue};
use vrt_ipc::{Handle, IpcError, PerCpu, Portal, Reply, Request, SessionId};

use crate::{ClientData, HostTimer, Result, TimerConfig, TimerError};

/// Operation codes of the timer portal
pub mod opcode {
    /// No input; replies with one wake handle per CPU
    pub const GET_WAKE_HANDLES: u64 = 0;
    /// Input: absolute deadline; programs the calling CPU
    pub const PROGRAM_TIMER: u64 = 1;
    /// No input; replies with uptime and wall-clock time
    pub const GET_TIME: u64 = 2;
}

const MICROS_PER_SEC: u64 = 1_000_000;

/// Session of one timer client
pub struct TimerSession {
    /// One wake handle per CPU, created with the session
    wakes: Box<[Handle]>,
    clients: PerCpu<ClientData>,
}

impl TimerSession {
    /// Backend state of `cpu` if the client has used that CPU yet
    pub fn client(&self, cpu: usize) -> Option<&ClientData> {
        self.clients.get(cpu)
    }

    /// CPUs the client has used so far
    pub fn active_cpus(&self) -> usize {
        self.clients.iter().count()
    }
}

/// Request handler of the timer service
pub struct TimerPortal {
    timer: HostTimer,
    /// Wall-clock time at startup, microseconds since the Unix epoch
    rtc_base: u64,
}

impl TimerPortal {
    /// Start the backend and take the wall-clock reference
    pub fn new(config: &TimerConfig) -> Result<Self> {
        let timer = HostTimer::new(config)?;
        Self::with_timer(timer)
    }

    /// Portal over an existing backend
    pub fn with_timer(timer: HostTimer) -> Result<Self> {
        let rtc_base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| TimerError::Rtc(err.to_string()))?
            .as_micros();
        let rtc_base = u64::try_from(rtc_base).map_err(|err| TimerError::Rtc(err.to_string()))?;
        log::info!("Timer service: wall clock base {} us", rtc_base);
        Ok(Self { timer, rtc_base })
    }

    pub fn timer(&self) -> &HostTimer {
        &self.timer
    }

    /// Uptime in ticks of the timer clock
    pub fn uptime(&self) -> TimeValue {
        self.timer.clock().time()
    }

    /// Wall-clock time in microseconds since the Unix epoch
    pub fn wall_clock(&self) -> u64 {
        let source = self.timer.clock();
        let uptime = clock::convert(source.time(), source.frequency(), MICROS_PER_SEC);
        self.rtc_base.saturating_add(uptime)
    }

    fn get_wake_handles(&self, session: &TimerSession) -> Reply {
        let mut reply = Reply::success();
        reply.push(session.wakes.len() as u64);
        for wake in session.wakes.iter() {
            reply.delegate(Arc::clone(wake));
        }
        reply
    }

    fn program_timer(&self, session: &TimerSession, deadline: TimeValue) -> vrt_ipc::Result<Reply> {
        let current = cpu::current().ok_or(IpcError::CrossCpu {
            owner: 0,
            current: None,
        })?;
        let wake = session
            .wakes
            .get(current)
            .ok_or(IpcError::NoSuchCpu { cpu: current })?;
        let client = match session.clients.get(current) {
            Some(client) => client,
            None => {
                let data = self.timer.client(current, Arc::clone(wake))?;
                session.clients.get_or_init(current, || data)?
            }
        };
        self.timer.program(client, deadline)?;
        Ok(Reply::success())
    }

    fn get_time(&self) -> Reply {
        let mut reply = Reply::success();
        reply.push(self.uptime()).push(self.wall_clock());
        reply
    }
}

impl Portal for TimerPortal {
    type Session = TimerSession;

    fn create_session(&self, id: SessionId, _args: &str, cpus: CpuSet) -> vrt_ipc::Result<TimerSession> {
        log::debug!("timer: session {} for {} CPU(s)", id, cpus.count());
        Ok(TimerSession {
            wakes: cpus.iter().map(|_| Arc::new(Notification::new())).collect(),
            clients: PerCpu::new(cpus),
        })
    }

    fn handle(&self, session: &TimerSession, request: &mut Request) -> vrt_ipc::Result<Reply> {
        match request.word()? {
            opcode::GET_WAKE_HANDLES => {
                request.finish_input()?;
                Ok(self.get_wake_handles(session))
            }
            opcode::PROGRAM_TIMER => {
                let deadline = request.word()?;
                request.finish_input()?;
                self.program_timer(session, deadline)
            }
            opcode::GET_TIME => {
                request.finish_input()?;
                Ok(self.get_time())
            }
            other => Err(IpcError::UnknownOpcode { opcode: other }),
        }
    }
}
