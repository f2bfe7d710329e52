use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use kform_dag::{Executor, Graph, Handler, RunStatus};

#[derive(Clone)]
enum Block {
    Root,
    Input(i32),
    Local(&'static str),
    Resource(&'static str),
}

#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
    order: Mutex<Vec<String>>,
    success: AtomicBool,
}

#[async_trait]
impl Handler<Block> for CountingHandler {
    async fn block_run(&self, name: &str, block: &Block) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(name.to_string());
        match block {
            Block::Root => true,
            Block::Input(value) => *value >= 0,
            Block::Local(expr) => !expr.is_empty(),
            Block::Resource(kind) => !kind.is_empty(),
        }
    }

    async fn post_run(&self, start: Instant, finish: Instant, success: bool) {
        assert!(finish >= start);
        self.success.store(success, Ordering::SeqCst);
    }
}

fn package() -> Graph<Block> {
    let graph = Graph::new();
    graph.add_vertex("root", Block::Root).unwrap();
    graph.add_vertex("input.x", Block::Input(1)).unwrap();
    graph.add_vertex("local.y", Block::Local("x + 1")).unwrap();
    graph
        .add_vertex("resource.r", Block::Resource("ConfigMap"))
        .unwrap();
    graph.connect("root", "input.x");
    graph.connect("input.x", "local.y");
    graph.connect("local.y", "resource.r");
    graph
}

#[tokio::test]
async fn test_package_execution_order() {
    let graph = package();
    let executor = Executor::new(CountingHandler::default());

    let status = executor.run(&graph, "root").await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let handler = executor.handler();
    assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        *handler.order.lock().unwrap(),
        vec!["root", "input.x", "local.y", "resource.r"]
    );
    assert!(handler.success.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reduced_package_execution() {
    // every block is also attached to the root, reduction should remove
    // those edges without changing the outcome
    let graph = package();
    graph.connect("root", "local.y");
    graph.connect("root", "resource.r");
    graph.transitive_reduction();
    assert_eq!(graph.down_vertices("root"), vec!["input.x"]);

    let executor = Executor::new(CountingHandler::default());
    let status = executor.run(&graph, "root").await.unwrap();

    assert!(status.is_success());
    assert_eq!(
        *executor.handler().order.lock().unwrap(),
        vec!["root", "input.x", "local.y", "resource.r"]
    );
}

#[tokio::test]
async fn test_invalid_block_stops_dependents() {
    let graph = package();
    graph.update_vertex("local.y", Block::Local("")).unwrap();

    let executor = Executor::new(CountingHandler::default());
    let status = executor.run(&graph, "root").await.unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(
        *executor.handler().order.lock().unwrap(),
        vec!["root", "input.x", "local.y"]
    );
    assert!(!executor.handler().success.load(Ordering::SeqCst));
}
