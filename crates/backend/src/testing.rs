//! Test doubles shared by the backend unit tests.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::Result;
use tts_engine::{
    InstancePool, SpeechModel, StyleCache, StyleTensor, SynthesisInput, SynthesisParams,
    Synthesized, VoiceStyle,
};

use crate::synth::Synthesizer;

/// Tracks how many fake calls run at once.
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyProbe {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One call as seen by the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub text: String,
    pub lang: String,
    pub style: VoiceStyle,
    pub params: SynthesisParams,
}

#[derive(Clone, Debug, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl CallLog {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[derive(Clone, Debug)]
enum Behavior {
    Constant(f32),
    Fail(String),
    Panic,
}

#[derive(Clone, Debug)]
pub struct FakeModel {
    behavior: Behavior,
    duration_secs: f32,
    delay: Duration,
    probe: ConcurrencyProbe,
    log: CallLog,
}

impl FakeModel {
    pub const SAMPLE_RATE: u32 = 16_000;
    pub const SAMPLES: usize = 160;

    pub fn constant(amplitude: f32) -> Self {
        Self {
            behavior: Behavior::Constant(amplitude),
            duration_secs: 0.01,
            delay: Duration::ZERO,
            probe: ConcurrencyProbe::default(),
            log: CallLog::default(),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            behavior: Behavior::Fail(message.to_string()),
            ..Self::constant(0.0)
        }
    }

    pub fn panicking() -> Self {
        Self {
            behavior: Behavior::Panic,
            ..Self::constant(0.0)
        }
    }

    pub fn with_duration(mut self, duration_secs: f32) -> Self {
        self.duration_secs = duration_secs;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_probe(mut self, probe: ConcurrencyProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }
}

impl SpeechModel for FakeModel {
    fn sample_rate(&self) -> u32 {
        Self::SAMPLE_RATE
    }

    fn synthesize(&mut self, input: &SynthesisInput<'_>) -> Result<Synthesized> {
        self.log.calls.lock().unwrap().push(RecordedCall {
            text: input.text.to_string(),
            lang: input.lang.to_string(),
            style: input.style.clone(),
            params: input.params.clone(),
        });
        self.probe.enter();
        thread::sleep(self.delay);
        self.probe.exit();

        match &self.behavior {
            Behavior::Constant(amplitude) => Ok(Synthesized {
                samples: vec![*amplitude; Self::SAMPLES],
                duration_secs: self.duration_secs,
            }),
            Behavior::Fail(message) => anyhow::bail!("{message}"),
            Behavior::Panic => panic!("engine crashed"),
        }
    }
}

/// A distinct style per `seed`, so lookups can be told apart.
pub fn style(seed: f32) -> VoiceStyle {
    VoiceStyle {
        ttl: StyleTensor {
            dims: vec![1, 2],
            data: vec![seed, seed + 0.1],
        },
        dp: StyleTensor {
            dims: vec![1, 1],
            data: vec![seed + 0.2],
        },
    }
}

/// A synthesizer over `models` that knows the speakers `alice` and `bob`.
pub fn synthesizer_with(models: Vec<FakeModel>) -> Synthesizer {
    synthesizer_with_params(models, SynthesisParams::default())
}

pub fn synthesizer_with_params(models: Vec<FakeModel>, params: SynthesisParams) -> Synthesizer {
    let models = models
        .into_iter()
        .map(|model| Box::new(model) as Box<dyn SpeechModel>)
        .collect();
    let pool = InstancePool::new(models).expect("at least one fake model");
    let styles = StyleCache::from_entries([
        ("alice".to_string(), style(0.1)),
        ("bob".to_string(), style(0.5)),
    ]);
    Synthesizer::new(pool, styles, params)
}
