use agile_serve::grpc::{infer_client::InferClient, InferRequest, ModelReadyRequest, Tensor};
use clap::{App, Arg};
use lz4_flex::compress_prepend_size;
use std::{
    error::Error,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tonic::transport::Channel;

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Default)]
struct Counters {
    done: AtomicUsize,
    rejected: AtomicUsize,
    latency_us: AtomicUsize,
}

async fn closed_loop(
    client: InferClient<Channel>,
    counters: Arc<Counters>,
    model: String,
    input: Vec<u8>,
    concurrency: usize,
) {
    let compressed_data = compress_prepend_size(&input);
    for _ in 0..concurrency {
        let mut client = client.clone();
        let counters = counters.clone();
        let model = model.clone();
        let compressed_data = compressed_data.clone();
        let len = input.len() as u64;
        tokio::spawn(async move {
            loop {
                let request = tonic::Request::new(InferRequest {
                    model: model.clone(),
                    inputs: vec![Tensor {
                        name: "input".to_string(),
                        shape: vec![len],
                        compressed_data: compressed_data.clone(),
                    }],
                    ..InferRequest::default()
                });
                let start = Instant::now();
                let fut = tokio::time::timeout(Duration::from_secs(10), client.infer(request));
                match fut.await {
                    Err(_) => println!("Closed loop miss deadline by 10 sec"),
                    Ok(Ok(_)) => {
                        counters.done.fetch_add(1, Ordering::SeqCst);
                        counters
                            .latency_us
                            .fetch_add(start.elapsed().as_micros() as usize, Ordering::SeqCst);
                    }
                    Ok(Err(status)) => {
                        log::debug!("request rejected: {}", status);
                        counters.rejected.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
    }
}

async fn telemetry(counters: Arc<Counters>, interval: Duration) {
    let mut last_done = 0;
    let mut last_latency = 0;
    loop {
        tokio::time::sleep(interval).await;
        let done = counters.done.load(Ordering::SeqCst);
        let latency = counters.latency_us.load(Ordering::SeqCst);
        let finished = done - last_done;
        let mean = if finished > 0 {
            (latency - last_latency) / finished
        } else {
            0
        };
        println!(
            "throughput {}/s, mean latency {}us, rejected {}",
            finished as f64 / interval.as_secs_f64(),
            mean,
            counters.rejected.load(Ordering::SeqCst)
        );
        last_done = done;
        last_latency = latency;
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let matches = App::new("Agile Serve Client")
        .about("A closed loop load generator for Agile Serve")
        .arg(
            Arg::with_name("address")
                .short("a")
                .help("Server endpoint")
                .default_value("http://127.0.0.1:8080")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("model")
                .short("n")
                .help("Model name, this should correspond to server's setting")
                .default_value("echo")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("concurrency")
                .short("c")
                .help(
                    "How many requests are in flight at once, \
                      this should be greater or equal to server's max batch size",
                )
                .default_value("16")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("input_size")
                .short("s")
                .help("Bytes per request input")
                .default_value("4096")
                .takes_value(true),
        )
        .get_matches();

    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp_micros().init();

    let address = matches
        .value_of("address")
        .unwrap_or("http://127.0.0.1:8080")
        .to_string();
    let model = matches.value_of("model").unwrap_or("echo").to_string();
    let concurrency: usize = matches.value_of("concurrency").unwrap_or("16").parse()?;
    let input_size: usize = matches.value_of("input_size").unwrap_or("4096").parse()?;

    let mut client = InferClient::connect(address).await?;
    let ready = client
        .model_ready(tonic::Request::new(ModelReadyRequest {
            model: model.clone(),
            version: 0,
        }))
        .await?
        .into_inner()
        .ready;
    if !ready {
        return Err(format!("model {} is not ready", model).into());
    }
    let counters = Arc::new(Counters::default());
    let input = (0..input_size).map(|i| i as u8).collect();
    tokio::spawn(telemetry(counters.clone(), Duration::from_secs(5)));
    closed_loop(client, counters, model, input, concurrency).await;
    loop {
        tokio::time::sleep(Duration::from_secs(1000)).await;
    }
}
