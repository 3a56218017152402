//! Call Timer - Gesprächsdauer
//!
//! Läuft nur im Zustand `connected` und meldet jede volle Sekunde
//! (beginnend mit 0 direkt beim Start).

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct CallTimer {
    started_at: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

impl CallTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startet den Timer neu; `on_tick` bekommt die verstrichenen Sekunden
    pub fn start(&mut self, on_tick: impl Fn(u64) + Send + 'static) {
        self.stop();
        self.started_at = Some(Instant::now());
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            let mut elapsed = 0u64;
            loop {
                interval.tick().await;
                on_tick(elapsed);
                elapsed += 1;
            }
        }));
    }

    /// Stoppt den Timer und gibt die Dauer zurück (no-op wenn er nicht läuft)
    pub fn stop(&mut self) -> Option<u64> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let elapsed = self.elapsed_seconds();
        self.started_at.take().map(|_| elapsed)
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Startzeitpunkt des laufenden Timers
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at
            .map(|start| start.elapsed().as_secs())
            .unwrap_or(0)
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Formatiert eine Dauer als `MM:SS`, ab einer Stunde als `H:MM:SS`
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(65), "01:05");
        assert_eq!(format_duration(3599), "59:59");
        assert_eq!(format_duration(3600 + 62), "1:01:02");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_start_at_zero() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = CallTimer::new();
        timer.start(move |elapsed| {
            let _ = tx.send(elapsed);
        });

        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(timer.elapsed_seconds(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reports_duration_and_halts_ticks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = CallTimer::new();
        timer.start(move |elapsed| {
            let _ = tx.send(elapsed);
        });

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(timer.elapsed_seconds(), 65);
        assert_eq!(timer.stop(), Some(65));
        assert!(!timer.is_running());
        assert_eq!(timer.stop(), None);
        assert_eq!(timer.elapsed_seconds(), 0);

        // Nach dem Stop kommen keine Ticks mehr, der Kanal schließt
        let mut last = None;
        while let Some(elapsed) = rx.recv().await {
            last = Some(elapsed);
        }
        assert!(last.unwrap_or(0) <= 65);
    }
}
