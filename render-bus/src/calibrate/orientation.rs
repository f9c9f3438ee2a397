use std::collections::VecDeque;
use std::sync::Arc;

use futures::FutureExt;

use crate::config::{OrientationWeights, PipelineConfig, RenderConfig};
use crate::error::{BusError, BusResult};
use crate::frame::{RenderedFrame, RotationCode};
use crate::reader::FrameReader;
use crate::scheduler::{RenderHandle, RenderScheduler};
use crate::source::SeekMode;

use super::progress;

const MIN_SAMPLES: usize = 3;
const LEVELS: usize = 3;

/// Average information content, in bits, of the values in `series`. Zero for
/// a constant series, 3 for a uniform spread over all eight values.
pub fn disorder(series: &[u8]) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; RotationCode::FIELD_VALUES as usize];
    for &v in series {
        counts[(v & 7) as usize] += 1;
    }
    let n = series.len() as f64;
    series
        .iter()
        .map(|&v| (n / counts[(v & 7) as usize] as f64).log2())
        .sum::<f64>()
        / n
}

/// Frame-to-frame change of every field, wrapped into `0..8`. One shorter
/// than the input.
fn difference(series: &[[u8; 4]]) -> Vec<[u8; 4]> {
    series
        .windows(2)
        .map(|w| {
            let mut d = [0u8; 4];
            for (i, slot) in d.iter_mut().enumerate() {
                *slot = w[1][i].wrapping_sub(w[0][i]) & 7;
            }
            d
        })
        .collect()
}

/// Consistency vote per field over the raw readings and their first and
/// second differences.
pub fn field_votes(codes: &[RotationCode], weights: &OrientationWeights) -> [f64; 4] {
    let mut votes = [0.0; RotationCode::FIELDS];
    let mut level: Vec<[u8; 4]> = codes.iter().map(|c| c.fields()).collect();
    for depth in 0..LEVELS {
        if level.is_empty() {
            break;
        }
        for (field, vote) in votes.iter_mut().enumerate() {
            let series: Vec<u8> = level.iter().map(|f| f[field]).collect();
            *vote += (weights.max_disorder - disorder(&series)) * weights.level(depth);
        }
        level = difference(&level);
    }
    votes
}

/// Index of the most consistent field, `None` below three samples.
pub fn select_field(codes: &[RotationCode], weights: &OrientationWeights) -> Option<usize> {
    if codes.len() < MIN_SAMPLES {
        return None;
    }
    let votes = field_votes(codes, weights);
    log::debug!("orientation votes {:?}", votes);
    votes
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

fn collect(codes: &mut Vec<RotationCode>, result: BusResult<RenderedFrame>) -> BusResult<()> {
    match result {
        Ok(rendered) => {
            if !codes.is_empty() || !rendered.rotation.is_zero() {
                codes.push(rendered.rotation);
            }
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(BusError::RetryExhausted { job }) => {
            log::debug!("orientation sample {} skipped, rotation unresolved", job);
            Ok(())
        }
        Err(e) => {
            log::warn!("orientation sample failed: {:#?}", e);
            Ok(())
        }
    }
}

/// Renders frames from a third of the way in and votes on which code field
/// carries the rotation. Sampling starts at the first non-zero code.
pub async fn estimate_orientation(
    reader: &mut FrameReader<'_>,
    scheduler: &RenderScheduler,
    config: Arc<RenderConfig>,
    scale: Option<f32>,
    pipeline: &PipelineConfig,
) -> BusResult<Option<usize>> {
    let duration_us = reader.info().duration_us;
    let target = pipeline.orientation_samples;
    reader.seek(duration_us / 3, SeekMode::AtOrBefore)?;

    let mut codes = Vec::new();
    let mut in_flight: VecDeque<RenderHandle> = VecDeque::new();
    while codes.len() <= target {
        let Some(frame) = reader.next_frame().await? else {
            break;
        };
        progress(&frame, duration_us);
        in_flight.push_back(scheduler.submit(frame, config.clone(), scale).await?);

        while let Some(handle) = in_flight.front_mut() {
            let Some(result) = handle.now_or_never() else {
                break;
            };
            in_flight.pop_front();
            collect(&mut codes, result)?;
        }
    }
    while let Some(handle) = in_flight.pop_front() {
        if codes.len() > target {
            break;
        }
        collect(&mut codes, handle.await)?;
    }
    reader.discard()?;

    let field = select_field(&codes, &pipeline.orientation_weights);
    match field {
        Some(f) => log::info!("orientation field {} from {} samples", f, codes.len()),
        None => log::info!("only {} orientation samples, orientation left unset", codes.len()),
    }
    Ok(field)
}
