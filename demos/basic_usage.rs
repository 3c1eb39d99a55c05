//! Basic walkthrough: read, cache hit, mutate, invalidate.
//!
//! Run with: RUST_LOG=debug cargo run --example basic_usage

use query_kit::{
    cache_key, use_api, Envelope, Error, MutationOptions, QueryClient, QueryOptions,
    RequestOptions, Response, Result,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
struct Todo {
    id: u32,
    title: String,
}

type Store = Arc<Mutex<BTreeMap<u32, Todo>>>;

/// Stand-in for a generated RPC client.
#[derive(Clone, Default)]
struct TodoApi {
    todos: Store,
}

impl TodoApi {
    fn list(&self) -> impl std::future::Future<Output = Response<Vec<Todo>, String>> {
        list_todos(self.todos.clone())
    }

    fn create(&self, title: String) -> impl std::future::Future<Output = Response<Todo, String>> {
        create_todo(self.todos.clone(), title)
    }
}

async fn list_todos(todos: Store) -> Response<Vec<Todo>, String> {
    let todos = todos
        .lock()
        .map_err(|_| Error::Transport("store poisoned".to_string()))?;
    Ok(Envelope::Ok(todos.values().cloned().collect()))
}

async fn create_todo(todos: Store, title: String) -> Response<Todo, String> {
    if title.trim().is_empty() {
        return Ok(Envelope::Err("title must not be empty".to_string()));
    }
    let mut todos = todos
        .lock()
        .map_err(|_| Error::Transport("store poisoned".to_string()))?;
    let todo = Todo {
        id: todos.len() as u32 + 1,
        title,
    };
    todos.insert(todo.id, todo.clone());
    Ok(Envelope::Ok(todo))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== Query Kit - Basic Example ===\n");

    let client = QueryClient::new();
    let todos = TodoApi::default();

    client
        .provide(async move {
            let api = use_api()?;

            // 1. First read - fetch
            println!("1. Mounting todo list...");
            let source = todos.clone();
            let mut list = api.query_with(
                cache_key!["todos"],
                move |_| source.list(),
                QueryOptions::default().stale_forever(),
                RequestOptions::default(),
            )?;
            let state = list.settled().await;
            println!("   ✓ {} todos ({})\n", state.data.map_or(0, |t| t.len()), state.status);

            // 2. Mutation that invalidates the list
            println!("2. Creating a todo...");
            let source = todos.clone();
            let create = api.mutation_with(
                move |title: String, _| source.create(title),
                MutationOptions::<String, Todo, String>::default().on_success(|todo, _, ctx| {
                    println!("   ✓ Created #{}: {}", todo.id, todo.title);
                    let _ = ctx.client.invalidate_queries(cache_key!["todos"]);
                }),
                RequestOptions::default(),
            );
            if let Err(e) = create.mutate_async("write docs".to_string()).await {
                println!("   ✗ {}", e);
            }

            // 3. Background refetch settles
            let state = list.settled().await;
            println!("   ✓ List now holds {} todos\n", state.data.map_or(0, |t| t.len()));

            // 4. Rejected write
            println!("3. Creating an invalid todo...");
            if let Err(e) = create.mutate_async(String::new()).await {
                println!("   ✗ {}\n", e);
            }

            Ok::<(), Error>(())
        })
        .await?;

    println!("=== Example Complete ===\n");
    Ok(())
}
