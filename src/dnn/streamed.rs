//! Backends whose host-to-device and device-to-host transfers are separate
//! streams, one per tensor. Writes and reads run concurrently and every
//! failure is reported.

use std::time::Instant;

use tracing::{debug, instrument};

use super::network::Backend;
use super::tensor::{Tensor, TensorAttr};
use crate::error::{Error, Result};

/// Host-to-device stream feeding one network input
pub trait InputStream: Send {
    fn attr(&self) -> &TensorAttr;
    fn write(&mut self, t: &Tensor) -> Result<()>;
}

/// Device-to-host stream producing one network output
pub trait OutputStream: Send {
    fn attr(&self) -> &TensorAttr;
    /// Blocks until the device has produced the output of the last write.
    fn read(&mut self) -> Result<Tensor>;
}

pub struct Streams {
    pub inputs: Vec<Box<dyn InputStream>>,
    pub outputs: Vec<Box<dyn OutputStream>>,
}

/// An accelerator exposing its model through per-tensor streams
pub trait StreamDevice: Send + 'static {
    /// Opens the device, loads the model and sets up the streams.
    fn configure(&mut self) -> Result<Streams>;

    fn name(&self) -> &str {
        "stream device"
    }
}

pub struct StreamedBackend<D: StreamDevice> {
    device: D,
    streams: Option<Streams>,
}

impl<D: StreamDevice> StreamedBackend<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            streams: None,
        }
    }

    fn streams(&self) -> Result<&Streams> {
        self.streams.as_ref().ok_or(Error::NotReady)
    }
}

impl<D: StreamDevice> Backend for StreamedBackend<D> {
    fn load(&mut self) -> Result<()> {
        let streams = self.device.configure()?;
        debug!(
            "{}: {} input and {} output streams",
            self.device.name(),
            streams.inputs.len(),
            streams.outputs.len()
        );
        self.streams = Some(streams);
        Ok(())
    }

    fn input_attrs(&self) -> Result<Vec<TensorAttr>> {
        Ok(self.streams()?.inputs.iter().map(|s| s.attr().clone()).collect())
    }

    fn output_attrs(&self) -> Result<Vec<TensorAttr>> {
        Ok(self.streams()?.outputs.iter().map(|s| s.attr().clone()).collect())
    }

    #[instrument(skip_all, name = "streamed_execute")]
    fn execute(&mut self, inputs: &[Tensor], info: &mut Vec<String>) -> Result<Vec<Tensor>> {
        let streams = self.streams.as_mut().ok_or(Error::NotReady)?;
        if inputs.len() != streams.inputs.len() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} input tensors", streams.inputs.len()),
                got: inputs.len().to_string(),
            });
        }
        let start = Instant::now();
        let (writes, reads) = transfer(streams, inputs)?;

        let mut errors = Vec::new();
        let mut outs = Vec::with_capacity(reads.len());
        for r in writes.into_iter().filter_map(Result::err) {
            errors.push(r);
        }
        for r in reads {
            match r {
                Ok(t) => outs.push(t),
                Err(e) => errors.push(e),
            }
        }
        if let Some(e) = Error::combine(errors) {
            return Err(e);
        }

        info.push(format!(
            "{}: {} writes, {} reads in {:.1}ms",
            self.device.name(),
            inputs.len(),
            outs.len(),
            start.elapsed().as_secs_f32() * 1000.0
        ));
        Ok(outs)
    }
}

type Outcome = (Vec<Result<()>>, Vec<Result<Tensor>>);

/// One scoped thread per stream; all are joined before returning.
fn transfer(streams: &mut Streams, inputs: &[Tensor]) -> Result<Outcome> {
    crossbeam::scope(|s| {
        let writers: Vec<_> = streams
            .inputs
            .iter_mut()
            .zip(inputs)
            .map(|(stream, t)| s.spawn(move |_| stream.write(t)))
            .collect();
        let readers: Vec<_> = streams
            .outputs
            .iter_mut()
            .map(|stream| s.spawn(move |_| stream.read()))
            .collect();

        let writes = writers
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(Error::backend("write task panicked"))))
            .collect();
        let reads = readers
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(Error::backend("read task panicked"))))
            .collect();
        (writes, reads)
    })
    .map_err(|_| Error::backend("transfer scope panicked"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnn::tensor::{DType, Layout};
    use flume::{Receiver, Sender};

    /// Loopback device: each output returns the matching input times two
    struct Loopback {
        n: usize,
        fail_write: Option<usize>,
        fail_read: Option<usize>,
    }

    struct In {
        attr: TensorAttr,
        tx: Sender<Tensor>,
        fail: bool,
    }

    struct Out {
        attr: TensorAttr,
        rx: Receiver<Tensor>,
        fail: bool,
    }

    impl InputStream for In {
        fn attr(&self) -> &TensorAttr {
            &self.attr
        }

        fn write(&mut self, t: &Tensor) -> Result<()> {
            if self.fail {
                return Err(Error::backend("write timeout"));
            }
            self.tx
                .send(t.clone())
                .map_err(|_| Error::backend("closed"))
        }
    }

    impl OutputStream for Out {
        fn attr(&self) -> &TensorAttr {
            &self.attr
        }

        fn read(&mut self) -> Result<Tensor> {
            if self.fail {
                return Err(Error::backend("read timeout"));
            }
            let t = self
                .rx
                .recv_timeout(std::time::Duration::from_millis(200))
                .map_err(|_| Error::backend("no data"))?;
            let doubled = t.data.to_f32_vec().iter().map(|v| v * 2.0).collect();
            Tensor::from_f32(t.dims().to_vec(), doubled)
        }
    }

    impl StreamDevice for Loopback {
        fn configure(&mut self) -> Result<Streams> {
            let attr = TensorAttr::new(Layout::Na, DType::F32, vec![1, 3]);
            let mut streams = Streams {
                inputs: Vec::new(),
                outputs: Vec::new(),
            };
            for i in 0..self.n {
                let (tx, rx) = flume::bounded(1);
                streams.inputs.push(Box::new(In {
                    attr: attr.clone(),
                    tx,
                    fail: self.fail_write == Some(i),
                }));
                streams.outputs.push(Box::new(Out {
                    attr: attr.clone(),
                    rx,
                    fail: self.fail_read == Some(i),
                }));
            }
            Ok(streams)
        }
    }

    fn inputs(n: usize) -> Vec<Tensor> {
        (0..n)
            .map(|i| Tensor::from_f32(vec![1, 3], vec![i as f32; 3]).unwrap())
            .collect()
    }

    #[test]
    fn outputs_come_back_in_stream_order() {
        let mut b = StreamedBackend::new(Loopback {
            n: 3,
            fail_write: None,
            fail_read: None,
        });
        b.load().unwrap();
        assert_eq!(b.input_attrs().unwrap().len(), 3);
        let mut info = Vec::new();
        let outs = b.execute(&inputs(3), &mut info).unwrap();
        assert_eq!(outs.len(), 3);
        assert_eq!(outs[2].as_f32().unwrap(), &[4.0, 4.0, 4.0]);
        assert_eq!(info.len(), 1);
    }

    #[test]
    fn all_transfer_errors_are_combined() {
        let mut b = StreamedBackend::new(Loopback {
            n: 3,
            fail_write: Some(0),
            fail_read: Some(2),
        });
        b.load().unwrap();
        let err = b.execute(&inputs(3), &mut Vec::new()).unwrap_err();
        // The failed write also starves its reader
        let Error::Multiple(errs) = err else {
            panic!("expected combined error, got {err}");
        };
        let text: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
        assert!(text.iter().any(|t| t.contains("write timeout")));
        assert!(text.iter().any(|t| t.contains("read timeout")));
    }

    #[test]
    fn not_loaded_is_not_ready() {
        let mut b = StreamedBackend::new(Loopback {
            n: 1,
            fail_write: None,
            fail_read: None,
        });
        assert!(matches!(b.input_attrs(), Err(Error::NotReady)));
        assert!(matches!(b.execute(&inputs(1), &mut Vec::new()), Err(Error::NotReady)));
    }
}
