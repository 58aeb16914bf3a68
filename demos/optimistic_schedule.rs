//! Scheduling dashboard example: shared bindings, optimistic rescheduling
//! with rollback, and family-wide invalidation.

use query_cache::{Error, OptimisticUpdate, QueryCache, QueryKey, QueryOptions, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Example entity: Visit
#[derive(Clone, Debug)]
struct Visit {
    id: String,
    caregiver: String,
    start: String,
}

/// Filter segment for the dashboard key
#[derive(Serialize)]
struct WeekFilter {
    week: u32,
    include_cancelled: bool,
}

/// Mock scheduling backend
#[derive(Clone, Default)]
struct ScheduleApi {
    visits: Arc<Mutex<Vec<Visit>>>,
    reject_next: Arc<AtomicBool>,
}

impl ScheduleApi {
    async fn list(&self) -> std::result::Result<Vec<Visit>, String> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        println!("  [API] Listing visits");
        let visits = self.visits.lock().map_err(|e| e.to_string())?;
        Ok(visits.clone())
    }

    async fn reschedule(&self, id: &str, start: &str) -> std::result::Result<(), String> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.reject_next.swap(false, Ordering::SeqCst) {
            println!("  [API] Reschedule of {} rejected", id);
            return Err(format!("visit {} overlaps another booking", id));
        }

        let mut visits = self.visits.lock().map_err(|e| e.to_string())?;
        for visit in visits.iter_mut().filter(|visit| visit.id == id) {
            visit.start = start.to_string();
        }
        println!("  [API] Rescheduled {} to {}", id, start);
        Ok(())
    }
}

fn moved(visits: Option<&Vec<Visit>>, id: &str, start: &str) -> Option<Vec<Visit>> {
    visits.map(|visits| {
        visits
            .iter()
            .map(|visit| {
                let mut visit = visit.clone();
                if visit.id == id {
                    visit.start = start.to_string();
                }
                visit
            })
            .collect()
    })
}

fn print_visits(label: &str, visits: Option<Vec<Visit>>) {
    println!("   {}:", label);
    for visit in visits.unwrap_or_default() {
        println!("     - {} {} with {}", visit.id, visit.start, visit.caregiver);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== Query Cache - Scheduling Example ===\n");

    let api = ScheduleApi::default();
    {
        let mut visits = api.visits.lock().map_err(|e| Error::Other(e.to_string()))?;
        visits.push(Visit {
            id: "v1".to_string(),
            caregiver: "Ada".to_string(),
            start: "09:00".to_string(),
        });
        visits.push(Visit {
            id: "v2".to_string(),
            caregiver: "Grace".to_string(),
            start: "13:00".to_string(),
        });
    }

    // 1. Two views bind the same query
    println!("1. Binding calendar and sidebar to the same week...");
    let cache = QueryCache::new();
    let week = QueryKey::builder("calendar-dashboard")
        .push_or(None::<&str>, "unlocked")
        .push_serialized(&WeekFilter {
            week: 42,
            include_cancelled: false,
        })
        .build()?;

    let fetch_api = api.clone();
    let calendar = cache.bind(QueryOptions::new(week.clone()), move || {
        let api = fetch_api.clone();
        async move { api.list().await }
    });
    let fetch_api = api.clone();
    let sidebar = cache.bind(
        QueryOptions::new(week.clone()).stale_time(Duration::from_secs(30)),
        move || {
            let api = fetch_api.clone();
            async move { api.list().await }
        },
    );

    tokio::join!(calendar.activate(), sidebar.activate());
    print_visits("Loaded once, shared by both", sidebar.data());
    println!();

    // 2. Optimistic reschedule that succeeds
    println!("2. Moving v1 to 10:00...");
    let mutate_api = api.clone();
    calendar
        .mutate(
            |prev: Option<&Vec<Visit>>| moved(prev, "v1", "10:00"),
            || async move { mutate_api.reschedule("v1", "10:00").await },
        )
        .await
        .map_err(Error::Other)?;
    print_visits("After reconciliation", sidebar.data());
    println!();

    // 3. Optimistic reschedule the server rejects
    println!("3. Moving v2 to 10:00 (server will reject)...");
    api.reject_next.store(true, Ordering::SeqCst);
    let update = OptimisticUpdate::apply(&cache, &week, |prev: Option<&Vec<Visit>>| {
        moved(prev, "v2", "10:00")
    });
    print_visits("Optimistic view", sidebar.data());

    match api.reschedule("v2", "10:00").await {
        Ok(()) => update.confirm(),
        Err(message) => {
            println!("   ✗ {}", message);
            update.rollback();
        }
    }
    print_visits("Rolled back", sidebar.data());
    println!();

    // 4. Invalidate the whole dashboard family after a bulk change
    println!("4. Invalidating every calendar-dashboard query...");
    let family = QueryKey::builder("calendar-dashboard").build()?;
    let count = cache.invalidate_prefix(&family);
    println!("   ✓ {} entries marked stale", count);

    sidebar.schedule_refresh(Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("   ✓ {:?}", cache.stats());

    println!("\n=== Example Complete ===\n");
    Ok(())
}
