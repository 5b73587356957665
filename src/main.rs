//! Orchestrator (§5): owns the session lifecycle — startup calibration,
//! sensor sources, the fan-out dispatcher, the three filter workers, the
//! liveness supervisor, and the status/autosave loop — and drives the
//! shutdown sequence on SIGINT/SIGTERM/duration expiry.
//!
//! Replaces the teacher's single `main()` loop (§9 re-architecture mandate):
//! where the teacher read both sensors and updated every filter inline in
//! one `tokio::select!` body, this splits sensor reading, fan-out, and each
//! filter's update loop into independent workers connected by bounded
//! queues, so a slow filter can no longer stall sensor ingestion.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use tokio::sync::Mutex as AsyncMutex;

use motion_tracker_rs::calibration::{self, CalibrationResult};
use motion_tracker_rs::config::{Args, TrackerConfig};
use motion_tracker_rs::dispatcher::{Dispatcher, DropCounters};
use motion_tracker_rs::error::MotionTrackerError;
use motion_tracker_rs::filters::complementary::ComplementaryFilter;
use motion_tracker_rs::filters::ekf_13d::Ekf13d;
use motion_tracker_rs::filters::es_ekf::EsEkf;
use motion_tracker_rs::filters::Filter;
use motion_tracker_rs::incident::IncidentDetector;
use motion_tracker_rs::live_status::{current_timestamp, LiveStatus};
use motion_tracker_rs::liveness::{LivenessAction, LivenessSupervisor};
use motion_tracker_rs::metrics::{current_rss_mb, DropRateMonitors, MemoryTracker, SampleRateTracker};
use motion_tracker_rs::persistence::{self, FilterFinalMetrics, FinalMetrics, SampleCache, SessionSummary, TrajectoryMap};
use motion_tracker_rs::sensor_source::{GpsChildSource, ImuChildSource, SensorSource};
use motion_tracker_rs::smoothing::AccelSmoother;
use motion_tracker_rs::trajectory::TrajectoryStore;
use motion_tracker_rs::types::{AccelSample, CovarianceSnapshot, EkfGpsDiagnostics, GpsSample, GyroSample, Sample, TrajectoryPoint};

const STARTUP_CALIBRATION_TIMEOUT_SECS: u64 = 10;
const POLL_INTERVAL: StdDuration = StdDuration::from_millis(20);
const WORKER_RECV_TIMEOUT: StdDuration = StdDuration::from_millis(100);
/// Dead-reckoning predict cadence for the ES-EKF (§4.7: "invokes `predict()`
/// at a cadence of `dt` (~20 ms) even without sensor events").
const ES_EKF_PREDICT_TIMEOUT: StdDuration = StdDuration::from_millis(20);
const STOP_POLL_INTERVAL: StdDuration = StdDuration::from_millis(200);
const LIVENESS_TICK_INTERVAL: StdDuration = StdDuration::from_secs(2);
const ACCEL_SMOOTHING_WINDOW: usize = 9;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let cfg: TrackerConfig = args.into();

    log::info!(
        target: "orchestrator",
        "motion_tracker starting: duration={}s gyro={} filter_mode={:?} output_dir={}",
        cfg.duration_secs, cfg.enable_gyro, cfg.filter_mode, cfg.output_dir
    );

    let session_id = format!("session_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let ts = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let paths = persistence::session_paths(&cfg.output_dir, &session_id, &ts);
    paths.ensure_dirs()?;

    // --- Sensor sources (§4.1) ---
    let imu_source: Arc<AsyncMutex<Box<dyn SensorSource>>> =
        Arc::new(AsyncMutex::new(Box::new(ImuChildSource::new("termux-sensor", cfg.enable_gyro))));
    let gps_source: Arc<AsyncMutex<Box<dyn SensorSource>>> =
        Arc::new(AsyncMutex::new(Box::new(GpsChildSource::new("termux-location"))));

    {
        let mut imu = imu_source.lock().await;
        if let Err(e) = imu.start().await {
            log::error!(target: "orchestrator", "fatal: accelerometer source failed to start: {e}");
            return Err(anyhow!("no accel frame within {STARTUP_CALIBRATION_TIMEOUT_SECS}s of startup: {e}"));
        }
    }
    {
        let mut gps = gps_source.lock().await;
        if let Err(e) = gps.start().await {
            log::warn!(target: "orchestrator", "gps source failed to start (continuing without GPS): {e}");
        }
    }

    // --- Startup calibration (§4.5): collect a stationary window directly
    // from the IMU source before fanning samples out to filters. ---
    let calibration = collect_startup_calibration(&imu_source, cfg.calibration_min_samples).await;
    log::info!(
        target: "orchestrator",
        "calibration complete={} gravity_mag={:.3} gyro_bias=({:.4},{:.4},{:.4})",
        calibration.complete,
        calibration.gravity_bias.magnitude(),
        calibration.gyro_bias.x, calibration.gyro_bias.y, calibration.gyro_bias.z
    );
    if !calibration.complete {
        log::error!(
            target: "orchestrator",
            "fatal: no accel frame received within {STARTUP_CALIBRATION_TIMEOUT_SECS}s of startup"
        );
        return Err(anyhow!(MotionTrackerError::NoAccelAtStartup { secs: STARTUP_CALIBRATION_TIMEOUT_SECS }));
    }
    if !(9.5..=10.1).contains(&calibration.gravity_bias.magnitude()) {
        log::warn!(target: "orchestrator", "calibration out of range; continuing with measured bias (§7 policy)");
    }

    // --- Dispatcher + per-filter inlets (§4.8) ---
    let (dispatcher, inlets, drops): (Dispatcher, _, Arc<DropCounters>) =
        Dispatcher::new(cfg.raw_queue_capacity, cfg.raw_queue_capacity, cfg.raw_queue_capacity);
    let dispatcher = Arc::new(dispatcher);

    // --- Filters (§4.3-§4.7) ---
    let ekf13d = Arc::new(StdRwLock::new(Ekf13d::new(0.5, 5.0, cfg.enable_gyro)));
    let es_ekf = Arc::new(StdRwLock::new(EsEkf::new(0.05, 5.0, 0.5, cfg.enable_gyro, 0.05)));
    let complementary = Arc::new(StdRwLock::new(ComplementaryFilter::new()));

    // --- Supporting subsystems ---
    let incident_detector = Arc::new(StdMutex::new(IncidentDetector::new(&paths.incidents)?));
    let trajectory_store = Arc::new(TrajectoryStore::new(&paths.buffer_chunks)?);
    let sample_cache = Arc::new(StdMutex::new(SampleCache::open(&paths.sqlite)?));
    let live_status = Arc::new(StdMutex::new(LiveStatus::new(session_id.clone())));

    let all_gps: Arc<StdMutex<Vec<GpsSample>>> = Arc::new(StdMutex::new(Vec::new()));
    let all_accel: Arc<StdMutex<Vec<AccelSample>>> = Arc::new(StdMutex::new(Vec::new()));
    let all_gyro: Arc<StdMutex<Vec<GyroSample>>> = Arc::new(StdMutex::new(Vec::new()));
    let ekf_diagnostics: Arc<StdMutex<Vec<EkfGpsDiagnostics>>> = Arc::new(StdMutex::new(Vec::new()));

    let accel_count = Arc::new(AtomicU64::new(0));
    let gyro_count = Arc::new(AtomicU64::new(0));
    let gps_count = Arc::new(AtomicU64::new(0));

    // §4.2/§4.12/§6.2: live restart tallies, kept outside the liveness task
    // itself so the status writer and the final session summary can both
    // read them without owning the supervisor.
    let accel_restart_count = Arc::new(AtomicU32::new(0));
    let gps_restart_count = Arc::new(AtomicU32::new(0));
    // §5/§7: "accel failure is fatal" — set once the IMU tracker exhausts
    // its restart budget, checked after shutdown to pick the exit code.
    let fatal = Arc::new(AtomicBool::new(false));

    let stop = Arc::new(AtomicBool::new(false));
    install_signal_handlers(stop.clone());
    if cfg.duration_secs > 0 {
        let stop = stop.clone();
        let duration = cfg.duration_secs;
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_secs(duration)).await;
            log::info!(target: "orchestrator", "session duration elapsed, stopping");
            stop.store(true, Ordering::SeqCst);
        });
    }

    let session_start = std::time::Instant::now();

    // --- Filter worker threads (§5: "per-filter worker (3)") ---
    let ekf13d_worker = spawn_ekf13d_worker(
        ekf13d.clone(),
        inlets.ekf13d,
        trajectory_store.clone(),
        ekf_diagnostics.clone(),
        stop.clone(),
    );
    let es_ekf_worker = spawn_es_ekf_worker(es_ekf.clone(), inlets.es_ekf, trajectory_store.clone(), stop.clone());
    let complementary_worker =
        spawn_complementary_worker(complementary.clone(), inlets.complementary, trajectory_store.clone(), stop.clone());

    // --- Sensor reader tasks (§4.1, §4.8) ---
    let imu_reader = {
        let imu_source = imu_source.clone();
        let dispatcher = dispatcher.clone();
        let incident_detector = incident_detector.clone();
        let all_accel = all_accel.clone();
        let all_gyro = all_gyro.clone();
        let accel_count = accel_count.clone();
        let gyro_count = gyro_count.clone();
        let es_ekf = es_ekf.clone();
        let stop = stop.clone();
        let gravity_bias = calibration.gravity_bias;
        let gyro_bias = calibration.gyro_bias;
        let mut smoother = AccelSmoother::new(ACCEL_SMOOTHING_WINDOW);
        tokio::spawn(async move {
            loop {
                let sample = { imu_source.lock().await.poll(POLL_INTERVAL) };
                match sample {
                    Some(Sample::Accel(mut s)) => {
                        let corrected = ((s.magnitude_m_s2 as f64) - gravity_bias.magnitude()).max(0.0);
                        s.magnitude_m_s2 = corrected as f32;
                        // Incident detection and the stored sample history see the
                        // raw corrected magnitude so a brake/impact spike isn't
                        // blunted; only the value fanned out to the filters is
                        // smoothed.
                        incident_detector.lock().unwrap().on_accel(s.t, s.magnitude_m_s2);
                        all_accel.lock().unwrap().push(s);
                        accel_count.fetch_add(1, Ordering::Relaxed);
                        let smoothed = smoother.apply(corrected);
                        dispatcher.dispatch(Sample::Accel(AccelSample { t: s.t, magnitude_m_s2: smoothed as f32 }));
                    }
                    Some(Sample::Gyro(mut g)) => {
                        g.wx -= gyro_bias.x as f32;
                        g.wy -= gyro_bias.y as f32;
                        g.wz -= gyro_bias.z as f32;
                        g.magnitude = (g.wx * g.wx + g.wy * g.wy + g.wz * g.wz).sqrt();
                        let heading_rate = es_ekf.read().unwrap().get_state().map(|s| s.heading_rate).unwrap_or(0.0);
                        incident_detector.lock().unwrap().on_gyro(g.t, g.wx, g.wy, g.wz, heading_rate);
                        all_gyro.lock().unwrap().push(g);
                        gyro_count.fetch_add(1, Ordering::Relaxed);
                        dispatcher.dispatch(Sample::Gyro(g));
                    }
                    Some(Sample::Gps(_)) => unreachable!("imu source never emits gps samples"),
                    None => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
            }
        })
    };

    let gps_reader = {
        let gps_source = gps_source.clone();
        let dispatcher = dispatcher.clone();
        let incident_detector = incident_detector.clone();
        let all_gps = all_gps.clone();
        let gps_count = gps_count.clone();
        let live_status = live_status.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            loop {
                let sample = { gps_source.lock().await.poll(POLL_INTERVAL) };
                match sample {
                    Some(Sample::Gps(s)) => {
                        incident_detector.lock().unwrap().on_gps(s.t, s.lat, s.lon, s.speed_m_s);
                        {
                            let mut status = live_status.lock().unwrap();
                            status.latest_gps_lat = Some(s.lat);
                            status.latest_gps_lon = Some(s.lon);
                            status.latest_gps_accuracy_m = Some(s.accuracy_m);
                        }
                        all_gps.lock().unwrap().push(s.clone());
                        gps_count.fetch_add(1, Ordering::Relaxed);
                        dispatcher.dispatch(Sample::Gps(s));
                    }
                    Some(_) => unreachable!("gps source never emits accel/gyro samples"),
                    None => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
            }
        })
    };

    // --- Liveness supervisor (§4.2) ---
    let liveness_task = {
        let imu_source = imu_source.clone();
        let gps_source = gps_source.clone();
        let stop = stop.clone();
        let fatal = fatal.clone();
        let accel_restart_count = accel_restart_count.clone();
        let gps_restart_count = gps_restart_count.clone();
        let mut supervisor = LivenessSupervisor::new(
            cfg.accel_silence_threshold_secs,
            cfg.gps_silence_threshold_secs,
            cfg.max_restart_attempts,
            cfg.restart_cooldown_secs,
        );
        tokio::spawn(async move {
            loop {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(LIVENESS_TICK_INTERVAL).await;
                {
                    let mut imu = imu_source.lock().await;
                    let action = supervisor.imu.check(imu.as_mut()).await;
                    accel_restart_count.store(supervisor.imu.restart_count(), Ordering::Relaxed);
                    // §5/§7: accel is the one sensor whose exhausted restart
                    // budget is fatal to the whole session (GPS/gyro may
                    // just run disabled).
                    if matches!(action, LivenessAction::Dead | LivenessAction::CircuitTripped) {
                        log::error!(
                            target: "orchestrator",
                            "fatal: accelerometer source exhausted restart attempts ({action:?})"
                        );
                        fatal.store(true, Ordering::SeqCst);
                        stop.store(true, Ordering::SeqCst);
                    }
                }
                {
                    let mut gps = gps_source.lock().await;
                    supervisor.gps.check(gps.as_mut()).await;
                    gps_restart_count.store(supervisor.gps.restart_count(), Ordering::Relaxed);
                }
            }
            supervisor
        })
    };

    // --- Status + autosave task (§4.8, §4.11, §4.12) ---
    let status_task = {
        let live_status = live_status.clone();
        let sample_cache = sample_cache.clone();
        let all_gps = all_gps.clone();
        let all_accel = all_accel.clone();
        let all_gyro = all_gyro.clone();
        let accel_count = accel_count.clone();
        let gyro_count = gyro_count.clone();
        let gps_count = gps_count.clone();
        let incident_detector = incident_detector.clone();
        let drops = drops.clone();
        let ekf13d = ekf13d.clone();
        let es_ekf = es_ekf.clone();
        let accel_restart_count = accel_restart_count.clone();
        let gps_restart_count = gps_restart_count.clone();
        let stop = stop.clone();
        let status_path = paths.dir.join("live_status.json");
        let status_interval = cfg.status_interval_secs.max(1);
        let autosave_interval = cfg.autosave_interval_secs.max(1);
        tokio::spawn(async move {
            let mut memory_tracker = MemoryTracker::default();
            let mut drop_rate_monitors = DropRateMonitors::new();
            let mut accel_rate = SampleRateTracker::new(10.0);
            let mut last_autosave_accel_len = 0usize;
            let mut last_autosave_gps_len = 0usize;
            let mut last_autosave_gyro_len = 0usize;
            let mut tick: u64 = 0;
            loop {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(StdDuration::from_secs(status_interval)).await;
                tick += status_interval;

                accel_rate.record(std::time::Instant::now());
                drop_rate_monitors.poll(&drops);
                let rss = memory_tracker.poll();

                let ekf_snapshot = ekf13d.read().unwrap().get_state();
                let es_ekf_heading = es_ekf.read().unwrap().get_state().map(|s| s.heading_deg).unwrap_or(0.0);
                {
                    let mut status = live_status.lock().unwrap();
                    status.elapsed_secs = session_start.elapsed().as_secs_f64();
                    status.last_update_epoch = current_timestamp();
                    status.accel_samples = accel_count.load(Ordering::Relaxed);
                    status.gyro_samples = gyro_count.load(Ordering::Relaxed);
                    status.gps_fixes = gps_count.load(Ordering::Relaxed);
                    status.incidents_detected = incident_detector.lock().unwrap().incident_count();
                    status.ekf_velocity_m_s = ekf_snapshot.velocity;
                    status.ekf_distance_m = ekf_snapshot.distance;
                    status.ekf_heading_deg = es_ekf_heading;
                    status.rss_mb = rss;
                    // Accel and gyro share the IMU liveness tracker (§4.2): one
                    // restart cycle restarts both, so they're reported together.
                    status.accel_restarts = accel_restart_count.load(Ordering::Relaxed);
                    status.gyro_restarts = accel_restart_count.load(Ordering::Relaxed);
                    status.gps_restarts = gps_restart_count.load(Ordering::Relaxed);
                    if let Err(e) = status.save(&status_path) {
                        log::warn!(target: "orchestrator", "failed to write live status: {e}");
                    }
                }

                if tick % autosave_interval == 0 {
                    let (gps_slice, accel_slice, gyro_slice) = {
                        let gps = all_gps.lock().unwrap();
                        let accel = all_accel.lock().unwrap();
                        let gyro = all_gyro.lock().unwrap();
                        (
                            gps[last_autosave_gps_len..].to_vec(),
                            accel[last_autosave_accel_len..].to_vec(),
                            gyro[last_autosave_gyro_len..].to_vec(),
                        )
                    };
                    last_autosave_gps_len += gps_slice.len();
                    last_autosave_accel_len += accel_slice.len();
                    last_autosave_gyro_len += gyro_slice.len();

                    let mut cache = sample_cache.lock().unwrap();
                    if let Err(e) = cache
                        .append_gps(&gps_slice)
                        .and_then(|_| cache.append_accel(&accel_slice))
                        .and_then(|_| cache.append_gyro(&gyro_slice))
                    {
                        log::warn!(target: "orchestrator", "autosave failed, will retry next interval: {e}");
                        last_autosave_gps_len -= gps_slice.len();
                        last_autosave_accel_len -= accel_slice.len();
                        last_autosave_gyro_len -= gyro_slice.len();
                    }
                }
            }
        })
    };

    // --- Wait for stop signal (§5 cancellation) ---
    while !stop.load(Ordering::SeqCst) {
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }

    // --- Shutdown sequence (§5): stop sources -> join readers -> drain
    // inlets (already done by workers observing the stop flag) -> join
    // filter workers -> final save -> close sqlite -> delete live status.
    log::info!(target: "orchestrator", "stopping sensor sources");
    imu_source.lock().await.stop().await;
    gps_source.lock().await.stop().await;

    let _ = imu_reader.await;
    let _ = gps_reader.await;
    let _ = liveness_task.await;
    status_task.abort();

    let _ = ekf13d_worker.join();
    let _ = es_ekf_worker.join();
    let _ = complementary_worker.join();

    incident_detector.lock().unwrap().flush();

    let final_metrics = FinalMetrics {
        ekf: filter_final_metrics(&*ekf13d.read().unwrap()),
        es_ekf: es_ekf_final_metrics(&*es_ekf.read().unwrap()),
        complementary: filter_final_metrics(&*complementary.read().unwrap()),
        ekf_gps_diagnostics: ekf_diagnostics.lock().unwrap().clone(),
    };

    let trajectories = TrajectoryMap {
        ekf: trajectory_store.ekf13d.export_all()?,
        es_ekf: trajectory_store.es_ekf.export_all()?,
        complementary: trajectory_store.complementary.export_all()?,
        es_ekf_dead_reckoning: trajectory_store.es_ekf_dead_reckoning.export_all()?,
    };
    let covariance_snapshots: Vec<CovarianceSnapshot> = trajectory_store.covariance.export_all()?;

    let gps_samples = all_gps.lock().unwrap().clone();
    let accel_samples = all_accel.lock().unwrap().clone();
    let gyro_samples = all_gyro.lock().unwrap().clone();

    let summary = SessionSummary {
        session_id: session_id.clone(),
        test_duration_minutes: if cfg.duration_secs > 0 { Some(cfg.duration_secs as f64 / 60.0) } else { None },
        actual_duration_seconds: session_start.elapsed().as_secs_f64(),
        peak_memory_mb: current_rss_mb().max(0.0),
        gps_available: !gps_samples.is_empty(),
        gps_fixes_collected: gps_count.load(Ordering::Relaxed),
        gps_first_fix_latency_seconds: gps_samples.first().map(|s| s.t),
        gps_daemon_restart_count: gps_restart_count.load(Ordering::Relaxed),
        calibration: Some(calibration),
        gps_samples: gps_samples.clone(),
        accel_samples,
        gyro_samples,
        trajectories,
        covariance_snapshots,
        incidents: Vec::new(),
        final_metrics,
    };

    summary.write(&paths.json, &paths.gz)?;
    persistence::export_gpx(&paths.gpx, &gps_samples, &summary.trajectories)?;
    log::info!(target: "orchestrator", "final save complete: {}", paths.json.display());

    // Close sqlite explicitly (drop releases the connection) and delete the
    // live-status file per §5's shutdown order.
    drop(sample_cache);
    let status_path = paths.dir.join("live_status.json");
    let _ = std::fs::remove_file(&status_path);

    log::info!(target: "orchestrator", "session {session_id} complete");

    if fatal.load(Ordering::SeqCst) {
        return Err(anyhow!(MotionTrackerError::AccelSourceDead { action: "restart budget exhausted".into() }));
    }
    Ok(())
}

fn install_signal_handlers(stop: Arc<AtomicBool>) {
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            log::info!(target: "orchestrator", "received SIGINT");
            stop.store(true, Ordering::SeqCst);
        });
    }
    #[cfg(unix)]
    {
        let stop = stop;
        tokio::spawn(async move {
            if let Ok(mut term) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                term.recv().await;
                log::info!(target: "orchestrator", "received SIGTERM");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }
}

/// Collects a stationary startup window directly from the IMU source
/// (bypassing the dispatcher) to compute the gravity and gyro biases
/// (§4.5). Gyro bias uses real per-axis readings; gravity bias is derived
/// from the accel magnitude stream alone, since the sensor source already
/// reduces raw accel to a scalar motion magnitude before it reaches this
/// point — §7's "invalid calibration: warn, continue with default g=9.81"
/// policy covers the case where too few samples arrive in time.
async fn collect_startup_calibration(
    imu_source: &Arc<AsyncMutex<Box<dyn SensorSource>>>,
    min_samples: usize,
) -> CalibrationResult {
    let mut accel_triples: Vec<(f64, f64, f64)> = Vec::with_capacity(min_samples);
    let mut gyro_triples: Vec<(f64, f64, f64)> = Vec::new();
    let deadline = std::time::Instant::now() + StdDuration::from_secs(STARTUP_CALIBRATION_TIMEOUT_SECS);

    while accel_triples.len() < min_samples && std::time::Instant::now() < deadline {
        let sample = { imu_source.lock().await.poll(POLL_INTERVAL) };
        match sample {
            Some(Sample::Accel(s)) => accel_triples.push((0.0, 0.0, s.magnitude_m_s2 as f64)),
            Some(Sample::Gyro(g)) => gyro_triples.push((g.wx as f64, g.wy as f64, g.wz as f64)),
            _ => tokio::time::sleep(POLL_INTERVAL).await,
        }
    }

    if accel_triples.len() < min_samples {
        log::warn!(
            target: "orchestrator",
            "calibration window incomplete ({}/{} samples); continuing with what was collected",
            accel_triples.len(), min_samples
        );
    }

    calibration::calculate_biases(&accel_triples, &gyro_triples)
}

fn filter_final_metrics(f: &impl Filter) -> FilterFinalMetrics {
    let state = f.get_state();
    FilterFinalMetrics {
        velocity_m_s: state.velocity,
        distance_m: state.distance,
        heading_deg: None,
        gps_updates: 0,
        accel_updates: 0,
        gyro_updates: 0,
    }
}

fn es_ekf_final_metrics(f: &EsEkf) -> FilterFinalMetrics {
    // `EsEkf::get_state` (inherent) returns the richer `EsEkfState`, shadowing
    // the `Filter` trait's uniform `FilterState` on this concrete receiver.
    let full = f.get_state();
    FilterFinalMetrics {
        velocity_m_s: full.as_ref().map(|s| s.velocity).unwrap_or(0.0),
        distance_m: full.as_ref().map(|s| s.distance).unwrap_or(0.0),
        heading_deg: full.as_ref().map(|s| s.heading_deg),
        gps_updates: full.as_ref().map(|s| s.gps_updates).unwrap_or(0),
        accel_updates: full.as_ref().map(|s| s.accel_updates).unwrap_or(0),
        gyro_updates: full.as_ref().map(|s| s.gyro_updates).unwrap_or(0),
    }
}

fn spawn_ekf13d_worker(
    filter: Arc<StdRwLock<Ekf13d>>,
    rx: crossbeam_channel::Receiver<Sample>,
    store: Arc<TrajectoryStore>,
    diagnostics: Arc<StdMutex<Vec<EkfGpsDiagnostics>>>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        match rx.recv_timeout(WORKER_RECV_TIMEOUT) {
            Ok(sample) => {
                let mut f = filter.write().unwrap();
                match sample {
                    Sample::Accel(s) => {
                        f.update_accel(s.magnitude_m_s2);
                    }
                    Sample::Gyro(g) => {
                        f.update_gyro(g.wx, g.wy, g.wz);
                    }
                    Sample::Gps(s) => {
                        f.update_gps(s.lat, s.lon, s.speed_m_s, s.accuracy_m);
                        let (lat, lon, uncertainty) = f.get_position();
                        let state = f.get_state();
                        let _ = store.ekf13d.push(TrajectoryPoint {
                            t: s.t,
                            lat,
                            lon,
                            velocity_m_s: state.velocity as f32,
                            uncertainty_m: uncertainty,
                        });
                        if let Some(diag) = f.get_diagnostics() {
                            let _ = store.covariance.push(CovarianceSnapshot {
                                t: diag.t,
                                trace: diag.covariance_diag.iter().sum(),
                                diag: diag.covariance_diag,
                            });
                            diagnostics.lock().unwrap().push(diag);
                        }
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    })
}

fn spawn_es_ekf_worker(
    filter: Arc<StdRwLock<EsEkf>>,
    rx: crossbeam_channel::Receiver<Sample>,
    store: Arc<TrajectoryStore>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        // §4.7: dead reckoning must advance on its own clock, not just when an
        // accel sample happens to arrive, so `predict()` is ticked here on a
        // ~20ms cadence independent of the event stream — on every timeout and
        // on event arrival if a full `dt` has elapsed since the last tick.
        let mut last_predict = std::time::Instant::now();
        loop {
            match rx.recv_timeout(ES_EKF_PREDICT_TIMEOUT) {
                Ok(sample) => {
                    let mut f = filter.write().unwrap();
                    if last_predict.elapsed() >= ES_EKF_PREDICT_TIMEOUT {
                        f.predict();
                        last_predict = std::time::Instant::now();
                    }
                    match sample {
                        Sample::Accel(s) => {
                            Filter::update_accel(&mut *f, s.magnitude_m_s2);
                            if f.should_emit_dead_reckoning(s.t) {
                                let (lat, lon, uncertainty) = f.get_position();
                                let velocity = f.velocity_magnitude();
                                let _ = store.es_ekf_dead_reckoning.push(TrajectoryPoint {
                                    t: s.t,
                                    lat,
                                    lon,
                                    velocity_m_s: velocity as f32,
                                    uncertainty_m: uncertainty as f32,
                                });
                            }
                        }
                        Sample::Gyro(g) => {
                            Filter::update_gyro(&mut *f, g.wx, g.wy, g.wz);
                        }
                        Sample::Gps(s) => {
                            Filter::update_gps(&mut *f, s.lat, s.lon, s.speed_m_s, s.accuracy_m);
                            // `EsEkf` has its own inherent `get_position`/`get_state` with
                            // richer return types; those shadow the `Filter` trait methods
                            // on a concrete `&EsEkf` receiver, which is what we want here.
                            let (lat, lon, uncertainty) = f.get_position();
                            let velocity = f.velocity_magnitude();
                            let _ = store.es_ekf.push(TrajectoryPoint {
                                t: s.t,
                                lat,
                                lon,
                                velocity_m_s: velocity as f32,
                                uncertainty_m: uncertainty as f32,
                            });
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    filter.write().unwrap().predict();
                    last_predict = std::time::Instant::now();
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    })
}

fn spawn_complementary_worker(
    filter: Arc<StdRwLock<ComplementaryFilter>>,
    rx: crossbeam_channel::Receiver<Sample>,
    store: Arc<TrajectoryStore>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        match rx.recv_timeout(WORKER_RECV_TIMEOUT) {
            Ok(sample) => {
                let mut f = filter.write().unwrap();
                match sample {
                    Sample::Accel(s) => {
                        f.update_accel(s.magnitude_m_s2);
                    }
                    Sample::Gyro(g) => {
                        f.update_gyro(g.wx, g.wy, g.wz);
                    }
                    Sample::Gps(s) => {
                        f.update_gps(s.lat, s.lon, s.speed_m_s, s.accuracy_m);
                        let (lat, lon, uncertainty) = f.get_position();
                        let state = f.get_state();
                        let _ = store.complementary.push(TrajectoryPoint {
                            t: s.t,
                            lat,
                            lon,
                            velocity_m_s: state.velocity as f32,
                            uncertainty_m: uncertainty,
                        });
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    })
}
