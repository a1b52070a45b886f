//! CUDA device and lanes

use super::{check, log_cuda_memory_error};
use crate::error::{Error, Result};
use crate::runtime::{Backend, DevicePtr, GemmLaunch, LaneStatus};
use crate::tile::HostTile;
use cudarc::cublas::CudaBlas;
use cudarc::cublas::sys::{cublasOperation_t, cublasSgemm_v2, cublasStatus_t};
use cudarc::driver::safe::{CudaContext, CudaStream};
use cudarc::driver::sys::{self, CUresult};
use std::sync::Arc;

/// A GPU driven through the CUDA driver API
#[derive(Clone)]
pub struct CudaDevice {
    ordinal: usize,
    context: Arc<CudaContext>,
}

impl std::fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDevice")
            .field("ordinal", &self.ordinal)
            .finish_non_exhaustive()
    }
}

/// One CUDA stream with its own cuBLAS handle
pub struct CudaLane {
    stream: Arc<CudaStream>,
    blas: CudaBlas,
    context: Arc<CudaContext>,
    /// Recorded on this stream when another lane must wait for it
    done: sys::CUevent,
}

// SAFETY: the event handle is only used by the thread owning the device,
// with the device's context bound first.
unsafe impl Send for CudaLane {}

impl Drop for CudaLane {
    fn drop(&mut self) {
        if self.done.is_null() || self.context.bind_to_thread().is_err() {
            return;
        }
        // SAFETY: the event was created on this context and is dropped once.
        let result = unsafe { sys::cuEventDestroy_v2(self.done) };
        if result != CUresult::CUDA_SUCCESS {
            log::warn!("cuEventDestroy failed: {result:?}");
        }
    }
}

impl CudaDevice {
    /// Create the primary context of GPU `ordinal`
    pub fn new(ordinal: usize) -> Result<Self> {
        let context = CudaContext::new(ordinal)?;
        Ok(Self { ordinal, context })
    }

    /// Driver ordinal
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Returns (free, total) bytes of device memory
    pub fn memory_info(&self) -> Result<(u64, u64)> {
        self.bind()?;
        let (free, total) = cudarc::driver::result::mem_get_info()?;
        Ok((free as u64, total as u64))
    }

    fn bind(&self) -> Result<()> {
        self.context.bind_to_thread()?;
        Ok(())
    }
}

impl Backend for CudaDevice {
    type Lane = CudaLane;

    fn name(&self) -> String {
        match self.context.name() {
            Ok(name) => format!("cuda:{} {}", self.ordinal, name),
            Err(_) => format!("cuda:{}", self.ordinal),
        }
    }

    fn usable_memory(&self) -> Result<u64> {
        let (free, _) = self.memory_info()?;
        Ok(free)
    }

    fn allocate(&self, size_bytes: usize) -> Result<DevicePtr> {
        self.bind()?;
        let mut ptr: DevicePtr = 0;
        // SAFETY: the context is bound and `ptr` is a valid out-pointer.
        let result = unsafe { sys::cuMemAlloc_v2(&mut ptr, size_bytes) };
        if result != CUresult::CUDA_SUCCESS {
            return Err(Error::OutOfMemory { size: size_bytes });
        }
        Ok(ptr)
    }

    fn deallocate(&self, ptr: DevicePtr, _size_bytes: usize) {
        if ptr == 0 || self.bind().is_err() {
            return;
        }
        // SAFETY: `ptr` came from `allocate` on this context and no lane uses it.
        let result = unsafe { sys::cuMemFree_v2(ptr) };
        if result != CUresult::CUDA_SUCCESS {
            log_cuda_memory_error("cuMemFree", ptr, result);
        }
    }

    fn create_lane(&self) -> Result<CudaLane> {
        self.bind()?;
        let stream = self.context.new_stream()?;
        let blas = CudaBlas::new(Arc::clone(&stream))
            .map_err(|e| Error::Backend(format!("cuBLAS initialization failed: {e:?}")))?;

        let mut done: sys::CUevent = std::ptr::null_mut();
        let flags = sys::CUevent_flags::CU_EVENT_DISABLE_TIMING as std::ffi::c_uint;
        // SAFETY: the context is bound and `done` is a valid out-pointer.
        let result = unsafe { sys::cuEventCreate(&mut done, flags) };
        check(result, |status| Error::Backend(format!("cuEventCreate: {status}")))?;

        Ok(CudaLane {
            stream,
            blas,
            context: Arc::clone(&self.context),
            done,
        })
    }

    fn copy_to_device(
        &self,
        lane: &mut CudaLane,
        src: &Arc<HostTile>,
        dst: DevicePtr,
    ) -> Result<()> {
        self.bind()?;
        let bytes = src.size_bytes();
        // SAFETY: the tile buffer never reallocates and the task keeps it
        // alive until the lane completes.
        let result = unsafe {
            sys::cuMemcpyHtoDAsync_v2(
                dst,
                src.as_mut_ptr() as *const std::ffi::c_void,
                bytes,
                lane.stream.cu_stream(),
            )
        };
        check(result, |status| {
            Error::copy_in(format!("{bytes} bytes to 0x{dst:x}: {status}"))
        })
    }

    fn copy_from_device(
        &self,
        lane: &mut CudaLane,
        src: DevicePtr,
        dst: &Arc<HostTile>,
    ) -> Result<()> {
        self.bind()?;
        let bytes = dst.size_bytes();
        // SAFETY: as for `copy_to_device`.
        let result = unsafe {
            sys::cuMemcpyDtoHAsync_v2(
                dst.as_mut_ptr() as *mut std::ffi::c_void,
                src,
                bytes,
                lane.stream.cu_stream(),
            )
        };
        check(result, |status| {
            Error::copy_out(format!("{bytes} bytes from 0x{src:x}: {status}"))
        })
    }

    fn launch_gemm(&self, lane: &mut CudaLane, launch: &GemmLaunch) -> Result<()> {
        self.bind()?;
        let dim = launch.dim as i32;

        // Row-major C = beta*C + alpha*A*B^T is column-major
        // C^T = beta*C^T + alpha*B*A^T: B transposed first, A as stored.
        // SAFETY: all three pointers are cache slots of `dim * dim` floats.
        let status = unsafe {
            cublasSgemm_v2(
                *lane.blas.handle(),
                cublasOperation_t::CUBLAS_OP_T,
                cublasOperation_t::CUBLAS_OP_N,
                dim,
                dim,
                dim,
                &launch.alpha,
                launch.b as *const f32,
                dim,
                launch.a as *const f32,
                dim,
                &launch.beta,
                launch.c as *mut f32,
                dim,
            )
        };
        if status != cublasStatus_t::CUBLAS_STATUS_SUCCESS {
            return Err(Error::Launch(format!("cublasSgemm_v2: {status:?}")));
        }
        Ok(())
    }

    fn query(&self, lane: &mut CudaLane) -> Result<LaneStatus> {
        self.bind()?;
        // SAFETY: the stream belongs to this context.
        let result = unsafe { sys::cuStreamQuery(lane.stream.cu_stream()) };
        match result {
            CUresult::CUDA_SUCCESS => Ok(LaneStatus::Ready),
            CUresult::CUDA_ERROR_NOT_READY => Ok(LaneStatus::Pending),
            other => Err(Error::Backend(format!("cuStreamQuery: {other:?}"))),
        }
    }

    fn synchronize(&self, lane: &mut CudaLane) -> Result<()> {
        self.bind()?;
        lane.stream.synchronize()?;
        Ok(())
    }

    fn wait_for(&self, lane: &mut CudaLane, producer: &mut CudaLane) -> Result<()> {
        self.bind()?;
        // SAFETY: both streams and the event belong to this context. The wait
        // captures the event as recorded now, so re-recording it later is fine.
        let result = unsafe { sys::cuEventRecord(producer.done, producer.stream.cu_stream()) };
        check(result, |status| Error::Backend(format!("cuEventRecord: {status}")))?;
        // SAFETY: as above.
        let result = unsafe { sys::cuStreamWaitEvent(lane.stream.cu_stream(), producer.done, 0) };
        check(result, |status| {
            Error::Backend(format!("cuStreamWaitEvent: {status}"))
        })
    }
}
