use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use model_sync::device::{DeviceError, DeviceRuntime, HostRuntime};
use model_sync::{
    DecaySchedule, DenseTensor, MirroredTensor, ModelSync, Phase, SyncConfig, SyncError,
};
use ps_client::{LocalCluster, ParameterServer};

fn cfg(async_buffered: bool) -> SyncConfig {
    SyncConfig::new(async_buffered, DecaySchedule::None, NonZeroUsize::MIN)
}

fn model(a: [f32; 2], b: [f32; 2]) -> Vec<MirroredTensor> {
    vec![
        MirroredTensor::from_values(1, 2, a.to_vec()),
        MirroredTensor::from_values(2, 1, b.to_vec()),
    ]
}

fn set(tensors: &mut [MirroredTensor], a: [f32; 2], b: [f32; 2]) {
    tensors[0].as_mut_slice().copy_from_slice(&a);
    tensors[1].as_mut_slice().copy_from_slice(&b);
}

fn values(tensors: &[MirroredTensor]) -> (Vec<f32>, Vec<f32>) {
    (tensors[0].as_slice().to_vec(), tensors[1].as_slice().to_vec())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mirrored_cycle_matches_host_semantics() -> model_sync::Result<()> {
    let cluster = LocalCluster::new(NonZeroUsize::MIN);
    let mut engine = ModelSync::mirrored(cfg(true), cluster.client(), HostRuntime::new())?;

    let mut tensors = model([1.0, 2.0], [3.0, 4.0]);
    engine.init_model(&mut tensors).await?;
    assert_eq!(values(&tensors), (vec![1.0, 2.0], vec![3.0, 4.0]));

    // Same one-behind cadence as the host engine, but every hand-off runs
    // through the device mirrors.
    set(&mut tensors, [10.0, 20.0], [30.0, 40.0]);
    engine.push_and_pull(&mut tensors).await?;
    assert_eq!(values(&tensors), (vec![1.0, 2.0], vec![3.0, 4.0]));

    set(&mut tensors, [100.0, 200.0], [300.0, 400.0]);
    engine.push_and_pull(&mut tensors).await?;
    assert_eq!(values(&tensors), (vec![10.0, 20.0], vec![30.0, 40.0]));

    set(&mut tensors, [1000.0, 2000.0], [3000.0, 4000.0]);
    engine.push_and_pull(&mut tensors).await?;
    assert_eq!(values(&tensors), (vec![109.0, 218.0], vec![327.0, 436.0]));

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn mirrored_inline_merge_round_trips() -> model_sync::Result<()> {
    let cluster = LocalCluster::new(NonZeroUsize::MIN);
    let mut engine = ModelSync::mirrored(cfg(false), cluster.client(), HostRuntime::new())?;

    let mut tensors = model([0.0, 0.0], [0.0, 0.0]);
    engine.init_model(&mut tensors).await?;

    // Storage -> mirror -> server -> snapshot -> mirror -> storage.
    set(&mut tensors, [5.0, 6.0], [7.0, 8.0]);
    engine.push_and_pull(&mut tensors).await?;
    assert_eq!(values(&tensors), (vec![5.0, 6.0], vec![7.0, 8.0]));

    let probe = cluster.client();
    let t0 = probe.create_table(1, 2).await.unwrap();
    let mut a = vec![0.0; 2];
    probe.get(t0, &mut a).await.unwrap();
    assert_eq!(a, vec![5.0, 6.0]);

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_mirrored_flush_is_not_resent_by_the_next_sync() {
    let cluster = LocalCluster::new(NonZeroUsize::MIN);
    let mut engine =
        ModelSync::mirrored(cfg(true), cluster.client(), HostRuntime::new()).unwrap();

    let mut tensors = model([1.0, 2.0], [3.0, 4.0]);
    engine.init_model(&mut tensors).await.unwrap();

    set(&mut tensors, [2.0, 3.0], [4.0, 5.0]);
    engine.push_and_pull(&mut tensors).await.unwrap();

    set(&mut tensors, [10.0, 20.0], [30.0, 40.0]);
    engine.push_model(&tensors).await.unwrap();

    // The sync after the flush stages the very same model, so its delta is
    // zero; the read slot's mirrors hand the flushed value back.
    engine.push_and_pull(&mut tensors).await.unwrap();
    assert_eq!(values(&tensors), (vec![10.0, 20.0], vec![30.0, 40.0]));

    engine.drain().await.unwrap();
    let reader = cluster.client();
    let t0 = reader.create_table(1, 2).await.unwrap();
    let t1 = reader.create_table(2, 1).await.unwrap();
    let mut a = vec![0.0; 2];
    let mut b = vec![0.0; 2];
    reader.get(t0, &mut a).await.unwrap();
    reader.get(t1, &mut b).await.unwrap();
    assert_eq!(a, vec![10.0, 20.0]);
    assert_eq!(b, vec![30.0, 40.0]);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn host_tensors_are_rejected_on_a_mirrored_engine() {
    let cluster = LocalCluster::new(NonZeroUsize::MIN);
    let mut engine =
        ModelSync::mirrored(cfg(true), cluster.client(), HostRuntime::new()).unwrap();

    let mut plain = vec![DenseTensor::zeros(1, 2)];
    let err = engine.init_model(&mut plain).await.unwrap_err();
    assert!(matches!(err, SyncError::MirrorUnsupported { table: 0 }));
    assert_eq!(engine.phase(), Phase::Uninitialized);

    // After a proper init, a host tensor is still turned away per call.
    let mut tensors = model([1.0, 1.0], [1.0, 1.0]);
    engine.init_model(&mut tensors).await.unwrap();
    let mut plain = vec![DenseTensor::zeros(1, 2), DenseTensor::zeros(2, 1)];
    let err = engine.push_and_pull(&mut plain).await.unwrap_err();
    assert!(matches!(err, SyncError::MirrorUnsupported { table: 0 }));
    assert_eq!(engine.phase(), Phase::Ready);

    engine.shutdown().await.unwrap();
}

/// Delegates to host copies but refuses device-to-device transfers.
struct BrokenTransfers;

impl DeviceRuntime for BrokenTransfers {
    type Buf = Vec<f32>;

    fn alloc(&self, len: usize) -> Result<Self::Buf, DeviceError> {
        HostRuntime::new().alloc(len)
    }

    fn upload(&self, src: &[f32], dst: &mut Self::Buf) -> Result<(), DeviceError> {
        HostRuntime::new().upload(src, dst)
    }

    fn download(&self, src: &Self::Buf, dst: &mut [f32]) -> Result<(), DeviceError> {
        HostRuntime::new().download(src, dst)
    }

    fn transfer(&self, _src: &Self::Buf, _dst: &mut Self::Buf) -> Result<(), DeviceError> {
        Err(DeviceError::Copy {
            direction: "device to device",
        })
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[tokio::test]
async fn stage_in_failure_faults_the_engine() {
    let cluster = LocalCluster::new(NonZeroUsize::MIN);
    let mut engine =
        ModelSync::mirrored(cfg(true), cluster.client(), BrokenTransfers).unwrap();

    // Init only uploads and downloads, so it gets through.
    let mut tensors = model([1.0, 2.0], [3.0, 4.0]);
    engine.init_model(&mut tensors).await.unwrap();

    // The first sync needs a device-to-device stage-in and dies on it.
    let err = engine.push_and_pull(&mut tensors).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Device(DeviceError::Copy {
            direction: "device to device"
        })
    ));
    assert_eq!(engine.phase(), Phase::Faulted);

    let err = engine.push_and_pull(&mut tensors).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::NotReady {
            phase: Phase::Faulted
        }
    ));
    assert!(engine.shutdown().await.is_err());
}

/// Works until armed, then fails every device-to-host download.
struct FlakyDownloads {
    broken: Arc<AtomicBool>,
}

impl DeviceRuntime for FlakyDownloads {
    type Buf = Vec<f32>;

    fn alloc(&self, len: usize) -> Result<Self::Buf, DeviceError> {
        HostRuntime::new().alloc(len)
    }

    fn upload(&self, src: &[f32], dst: &mut Self::Buf) -> Result<(), DeviceError> {
        HostRuntime::new().upload(src, dst)
    }

    fn download(&self, src: &Self::Buf, dst: &mut [f32]) -> Result<(), DeviceError> {
        if self.broken.load(Ordering::Relaxed) {
            return Err(DeviceError::Copy {
                direction: "device to host",
            });
        }
        HostRuntime::new().download(src, dst)
    }

    fn transfer(&self, src: &Self::Buf, dst: &mut Self::Buf) -> Result<(), DeviceError> {
        HostRuntime::new().transfer(src, dst)
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn merge_failure_surfaces_on_the_next_call() {
    let cluster = LocalCluster::new(NonZeroUsize::MIN);
    let broken = Arc::new(AtomicBool::new(false));
    let runtime = FlakyDownloads {
        broken: Arc::clone(&broken),
    };
    let mut engine = ModelSync::mirrored(cfg(true), cluster.client(), runtime).unwrap();

    let mut tensors = model([1.0, 2.0], [3.0, 4.0]);
    engine.init_model(&mut tensors).await.unwrap();

    // This sync spawns a merge that will fail on its mirror download.
    broken.store(true, Ordering::Relaxed);
    set(&mut tensors, [10.0, 20.0], [30.0, 40.0]);
    engine.push_and_pull(&mut tensors).await.unwrap();

    // The failure comes home when the next call joins the merge.
    let err = engine.push_and_pull(&mut tensors).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Device(DeviceError::Copy {
            direction: "device to host"
        })
    ));
    assert_eq!(engine.phase(), Phase::Faulted);
}
